//! The trait provider implementations fill in.
//!
//! The protocol core owns ordering, locking, diffing, and state upgrade
//! plumbing; what a specific resource type actually does against an
//! external system comes in through [`ProviderService`]. Methods with a
//! reasonable protocol-level default (no-op validation, pass-through
//! prepare, unsupported import) have one.

use serde_json::Value;

use crate::diagnostics::Diagnostic;
use crate::error::ProtocolError;
use crate::schema::ProviderSchema;
use crate::types::{ImportedResource, ProviderMetadata};
use crate::upgrade::StateUpgraders;

/// Why an apply did not complete, and what it left behind.
///
/// Apply is not naturally transactional: some attribute changes may have
/// taken effect before the failure. `partial_state` is the best-known state
/// of the resource after the failure; callers persist it rather than losing
/// the progress. `None` means nothing changed.
#[derive(Debug)]
pub struct ApplyFailure {
    /// Best-known state after the partial apply, if anything changed.
    pub partial_state: Option<Value>,
    /// What went wrong.
    pub error: ProtocolError,
}

impl ApplyFailure {
    /// A failure that changed nothing.
    pub fn total(error: ProtocolError) -> Self {
        Self {
            partial_state: None,
            error,
        }
    }

    /// A failure after some changes took effect.
    pub fn partial(state: Value, error: ProtocolError) -> Self {
        Self {
            partial_state: Some(state),
            error,
        }
    }
}

impl From<ProtocolError> for ApplyFailure {
    fn from(error: ProtocolError) -> Self {
        Self::total(error)
    }
}

impl std::fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.partial_state.is_some() {
            write!(f, "apply failed after partial progress: {}", self.error)
        } else {
            write!(f, "apply failed: {}", self.error)
        }
    }
}

impl std::error::Error for ApplyFailure {}

/// Trait that provider implementations must implement.
///
/// # Example
///
/// ```ignore
/// use hemmer_plugin_core::{ProviderService, ProtocolError, ApplyFailure};
/// use hemmer_plugin_core::schema::{ProviderSchema, Schema, Attribute};
///
/// struct MyProvider;
///
/// #[async_trait::async_trait]
/// impl ProviderService for MyProvider {
///     fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
///         Ok(ProviderSchema::new()
///             .with_resource("example_resource", Schema::v0()
///                 .with_attribute("name", Attribute::required_string())
///                 .with_attribute("id", Attribute::computed_string())))
///     }
///
///     async fn configure(
///         &self,
///         _config: serde_json::Value,
///     ) -> Result<Vec<hemmer_plugin_core::Diagnostic>, ProtocolError> {
///         Ok(vec![])
///     }
///
///     async fn apply(
///         &self,
///         _resource_type: &str,
///         _prior: Option<serde_json::Value>,
///         planned: serde_json::Value,
///     ) -> Result<serde_json::Value, ApplyFailure> {
///         Ok(planned)
///     }
///
///     async fn read(
///         &self,
///         _resource_type: &str,
///         current: serde_json::Value,
///     ) -> Result<Option<serde_json::Value>, ProtocolError> {
///         Ok(Some(current))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Return the provider's full schema catalogue.
    ///
    /// An `Err` here is session-fatal: the registry cannot be built and no
    /// further operations proceed for this provider.
    fn schema(&self) -> Result<ProviderSchema, ProtocolError>;

    /// Return the per-version state upgrade steps this provider supplies.
    fn state_upgraders(&self) -> StateUpgraders {
        StateUpgraders::new()
    }

    /// Return provider metadata for performance optimization.
    /// By default, this is derived from the schema.
    fn metadata(&self) -> Result<ProviderMetadata, ProtocolError> {
        let schema = self.schema()?;
        Ok(ProviderMetadata {
            resources: schema.resources.keys().cloned().collect(),
            data_sources: schema.data_sources.keys().cloned().collect(),
            capabilities: Default::default(),
        })
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Normalize and pre-validate the provider configuration before
    /// `configure`. Returns the prepared config plus diagnostics.
    async fn prepare_config(
        &self,
        config: Value,
    ) -> Result<(Value, Vec<Diagnostic>), ProtocolError> {
        Ok((config, vec![]))
    }

    /// Configure the provider with credentials and settings.
    /// Returns diagnostics (errors and warnings).
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProtocolError>;

    /// Stop the provider gracefully. A provider incapable of stopping
    /// returns success immediately; a no-op stop is valid.
    async fn stop(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource's configuration before planning. Side-effect
    /// free.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProtocolError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Derive the proposed state for a plan from the prior state and
    /// configuration. The default proposes the configuration as-is; the
    /// core then fills schema defaults and marks unset computed attributes
    /// unknown.
    async fn propose(
        &self,
        resource_type: &str,
        prior: Option<Value>,
        config: Value,
    ) -> Result<Value, ProtocolError> {
        let _ = (resource_type, prior);
        Ok(config)
    }

    /// Execute a planned change, returning the new state.
    ///
    /// On partial failure, return [`ApplyFailure::partial`] with the
    /// best-known state so the caller can persist the progress. An apply
    /// already past its point of external effect must run to completion.
    async fn apply(
        &self,
        resource_type: &str,
        prior: Option<Value>,
        planned: Value,
    ) -> Result<Value, ApplyFailure>;

    /// Read the current state of a resource. `Ok(None)` means the resource
    /// no longer exists, which is a valid outcome rather than an error.
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, ProtocolError>;

    /// Import existing infrastructure into management by external id,
    /// producing one or more freshly read resource states.
    async fn import(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProtocolError> {
        let _ = id;
        Err(ProtocolError::Provider(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }

    // =========================================================================
    // Data Source Operations
    // =========================================================================

    /// Validate a data source's configuration. Side-effect free.
    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProtocolError> {
        let _ = (data_source_type, config);
        Ok(vec![])
    }

    /// Read data from an external source. Data sources have no persisted
    /// lifecycle, only computed-on-read values.
    async fn read_data_source(
        &self,
        data_source_type: &str,
        _config: Value,
    ) -> Result<Value, ProtocolError> {
        Err(ProtocolError::UnknownDataSource(
            data_source_type.to_string(),
        ))
    }
}
