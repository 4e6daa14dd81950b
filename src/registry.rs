//! The per-session schema registry.
//!
//! Holds the declared shape of every resource and data source type a
//! provider supports, plus its configuration schema. Built exactly once per
//! provider session, before any other operation, and immutable afterwards;
//! all concurrent instance operations share it read-only.

use crate::error::ProtocolError;
use crate::schema::{ProviderSchema, Schema};

/// Immutable catalogue of a provider's schemas for one session.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    catalogue: ProviderSchema,
}

impl SchemaRegistry {
    /// Build a registry from a provider's declared schema catalogue.
    pub fn new(catalogue: ProviderSchema) -> Self {
        Self { catalogue }
    }

    /// The full catalogue, as declared.
    pub fn catalogue(&self) -> &ProviderSchema {
        &self.catalogue
    }

    /// The provider's own configuration schema.
    pub fn provider_config_schema(&self) -> &Schema {
        &self.catalogue.provider
    }

    /// The schema for a resource type.
    pub fn resource(&self, resource_type: &str) -> Result<&Schema, ProtocolError> {
        self.catalogue
            .resources
            .get(resource_type)
            .ok_or_else(|| ProtocolError::UnknownResourceType(resource_type.to_string()))
    }

    /// The schema for a data source type.
    pub fn data_source(&self, data_source_type: &str) -> Result<&Schema, ProtocolError> {
        self.catalogue
            .data_sources
            .get(data_source_type)
            .ok_or_else(|| ProtocolError::UnknownDataSource(data_source_type.to_string()))
    }

    /// The current schema version for a resource type.
    pub fn current_version(&self, resource_type: &str) -> Result<u64, ProtocolError> {
        self.resource(resource_type).map(|s| s.version)
    }

    /// Names of all resource types, in deterministic order.
    pub fn resource_types(&self) -> Vec<String> {
        self.catalogue.resources.keys().cloned().collect()
    }

    /// Names of all data source types, in deterministic order.
    pub fn data_source_types(&self) -> Vec<String> {
        self.catalogue.data_sources.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(
            ProviderSchema::new()
                .with_provider_config(
                    Schema::v0().with_attribute("endpoint", Attribute::optional_string()),
                )
                .with_resource(
                    "disk",
                    Schema::new(2).with_attribute("capacity", Attribute::required_string()),
                )
                .with_data_source(
                    "image",
                    Schema::v0().with_attribute("filter", Attribute::optional_string()),
                ),
        )
    }

    #[test]
    fn test_lookup_resource() {
        let registry = registry();
        assert_eq!(registry.resource("disk").unwrap().version, 2);
        assert_eq!(registry.current_version("disk").unwrap(), 2);

        let err = registry.resource("missing").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownResourceType(_)));
    }

    #[test]
    fn test_lookup_data_source() {
        let registry = registry();
        assert!(registry.data_source("image").is_ok());

        let err = registry.data_source("missing").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownDataSource(_)));
    }

    #[test]
    fn test_type_listings() {
        let registry = registry();
        assert_eq!(registry.resource_types(), vec!["disk".to_string()]);
        assert_eq!(registry.data_source_types(), vec!["image".to_string()]);
    }

    #[test]
    fn test_provider_config_schema() {
        let registry = registry();
        assert!(registry
            .provider_config_schema()
            .attribute("endpoint")
            .is_some());
    }
}
