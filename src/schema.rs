//! Schema types describing provider, resource, and data source shapes.
//!
//! A [`Schema`] is data, not a compile-time type: a versioned mapping from
//! attribute name to descriptor. State values are validated against it at
//! decode time. Once published for a (provider, type, version) triple a
//! schema never changes; new provider releases bump the version instead.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Shape of the values an attribute accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// UTF-8 text.
    String,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE 754 double-precision number.
    Float64,
    /// True or false.
    Bool,
    /// Ordered sequence with a uniform element type.
    List(Box<AttributeType>),
    /// Unordered collection of distinct values with a uniform element type.
    Set(Box<AttributeType>),
    /// String keys mapping to values of a uniform type.
    Map(Box<AttributeType>),
    /// Record with a fixed field layout.
    Object(HashMap<String, AttributeType>),
    /// Accepts any value shape; prefer a concrete type where possible.
    Dynamic,
}

impl AttributeType {
    /// List of `element_type` values.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Set of `element_type` values.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Map with `element_type` values.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }

    /// Object with the given named fields.
    pub fn object(attributes: HashMap<String, AttributeType>) -> Self {
        Self::Object(attributes)
    }
}

/// Behavioural flags controlling who supplies an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// Callers must set the attribute in configuration.
    pub required: bool,
    /// Callers may omit the attribute from configuration.
    pub optional: bool,
    /// The provider fills the attribute in; configuration cannot set it.
    pub computed: bool,
    /// The value is redacted from logs and human-facing output.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Flags for an attribute configuration must supply.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Flags for an attribute configuration may leave out.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Flags for an attribute only the provider writes.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Flags for an attribute configuration may set and the provider
    /// otherwise chooses.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Redact the value from human-facing output.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// One named field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Value shape the attribute accepts.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Who supplies the value and how it is displayed.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Prose shown in generated documentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether a change to this attribute requires replacing the resource.
    #[serde(default)]
    pub force_new: bool,
    /// Value used when configuration leaves the attribute unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Attribute {
    /// Build an attribute from a type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
        }
    }

    /// Required string.
    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    /// Optional string.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Provider-computed string.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    /// Required 64-bit integer.
    pub fn required_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::required())
    }

    /// Optional 64-bit integer.
    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    /// Provider-computed 64-bit integer.
    pub fn computed_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::computed())
    }

    /// Required boolean.
    pub fn required_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::required())
    }

    /// Optional boolean.
    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// Provider-computed boolean.
    pub fn computed_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::computed())
    }

    /// Attach documentation prose.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Changing this attribute tears the resource down and recreates it.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Value to plan when configuration leaves the attribute unset.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Redact this attribute from human-facing output.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }
}

/// Schema for a resource, data source, or provider configuration.
///
/// Attributes are kept in a `BTreeMap` so iteration, and therefore plan
/// diff ordering, is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The version of this schema. Monotonically increasing across provider
    /// releases; stored state is tagged with the version it was written
    /// under and must be upgraded when it lags.
    #[serde(default)]
    pub version: u64,
    /// Declared attributes, keyed by name.
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Schema {
    /// Empty schema at an explicit version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Empty schema for a first release.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Insert an attribute, replacing any earlier one with the same name.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Fetch a declared attribute, if any.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Sorted names of the attributes configuration must supply.
    pub fn required_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.flags.required)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::v0()
    }
}

/// The full schema catalogue a provider declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Shape of the provider-level configuration block.
    #[serde(default)]
    pub provider: Schema,
    /// Per-resource-type schemas.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
    /// Per-data-source-type schemas.
    #[serde(default)]
    pub data_sources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    /// Catalogue with nothing declared yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the provider-level configuration shape.
    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    /// Declare a resource type.
    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Declare a data source type.
    pub fn with_data_source(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_type_constructors() {
        assert!(matches!(
            AttributeType::list(AttributeType::Bool),
            AttributeType::List(_)
        ));
        assert!(matches!(
            AttributeType::set(AttributeType::String),
            AttributeType::Set(_)
        ));
        assert!(matches!(
            AttributeType::map(AttributeType::Int64),
            AttributeType::Map(_)
        ));
    }

    #[test]
    fn test_flag_combinations() {
        assert!(AttributeFlags::required().required);
        assert!(!AttributeFlags::required().computed);
        assert!(AttributeFlags::computed().computed);
        assert!(!AttributeFlags::computed().optional);

        let oc = AttributeFlags::optional_computed();
        assert!(oc.optional && oc.computed && !oc.required);

        assert!(AttributeFlags::optional().sensitive().sensitive);
    }

    #[test]
    fn test_attribute_builder_chain() {
        let attr = Attribute::optional_int64()
            .with_description("Provisioned capacity")
            .with_default(json!(1))
            .with_force_new();

        assert_eq!(attr.attr_type, AttributeType::Int64);
        assert!(attr.flags.optional);
        assert_eq!(attr.default, Some(json!(1)));
        assert!(attr.force_new);
        assert_eq!(attr.description.as_deref(), Some("Provisioned capacity"));
    }

    #[test]
    fn test_required_attribute_listing() {
        let schema = Schema::new(3)
            .with_attribute("region", Attribute::required_string())
            .with_attribute("zone", Attribute::optional_string())
            .with_attribute("arn", Attribute::computed_string());

        assert_eq!(schema.version, 3);
        assert!(schema.attribute("zone").is_some());
        assert!(schema.attribute("nonexistent").is_none());
        assert_eq!(
            schema.required_attributes().collect::<Vec<_>>(),
            vec!["region"]
        );
    }

    #[test]
    fn test_attribute_iteration_is_sorted() {
        let schema = Schema::v0()
            .with_attribute("zone", Attribute::optional_string())
            .with_attribute("arn", Attribute::optional_string())
            .with_attribute("region", Attribute::optional_string());

        let names: Vec<_> = schema.attributes.keys().cloned().collect();
        assert_eq!(names, vec!["arn", "region", "zone"]);
    }

    #[test]
    fn test_catalogue_builder() {
        let catalogue = ProviderSchema::new()
            .with_provider_config(
                Schema::v0().with_attribute("token", Attribute::required_string().sensitive()),
            )
            .with_resource(
                "volume",
                Schema::new(1).with_attribute("capacity", Attribute::required_int64()),
            )
            .with_data_source(
                "volume_lookup",
                Schema::v0().with_attribute("filter", Attribute::optional_string()),
            );

        assert!(catalogue.provider.attribute("token").unwrap().flags.sensitive);
        assert_eq!(catalogue.resources["volume"].version, 1);
        assert!(catalogue.data_sources.contains_key("volume_lookup"));
    }
}
