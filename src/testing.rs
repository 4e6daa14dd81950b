//! Testing utilities for provider implementations.
//!
//! This module provides utilities to test `ProviderService` implementations
//! without spinning up a full gRPC server. The harness drives the same
//! lifecycle machine the server uses, so ordering rules (configure-first,
//! plan-before-apply, stale-plan detection) hold in tests exactly as they
//! do over the wire.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_plugin_core::testing::ProviderTester;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_resource() {
//!     let tester = ProviderTester::new(MyProvider::new()).unwrap();
//!
//!     // Configure the provider
//!     tester.configure(json!({"api_key": "test"})).await.unwrap();
//!
//!     // Plan and apply a create
//!     let state = tester
//!         .create("my_resource", "a", json!({"name": "test-resource"}))
//!         .await
//!         .unwrap()
//!         .expect("create should produce a state");
//!
//!     assert_eq!(state.known("name"), Some(&json!("test-resource")));
//! }
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::diagnostics::{Diagnostic, Diagnostics, Severity};
use crate::error::ProtocolError;
use crate::lifecycle::{ApplyOutcome, InstanceKey, ResourceLifecycle};
use crate::provider::ProviderService;
use crate::schema::ProviderSchema;
use crate::state::{RawState, TypedState};
use crate::types::{ImportedResource, Plan};

/// A test harness for provider implementations.
///
/// This wraps a `ProviderService` in the full lifecycle machine and
/// provides simplified methods for testing without a gRPC server.
///
/// # Example
///
/// ```ignore
/// use hemmer_plugin_core::testing::ProviderTester;
///
/// let tester = ProviderTester::new(MyProvider::new()).unwrap();
/// tester.configure(json!({})).await.unwrap();
/// let plan = tester.plan("my_resource", "a", None, json!({"name": "test"})).await.unwrap();
/// ```
pub struct ProviderTester<P: ProviderService> {
    lifecycle: Arc<ResourceLifecycle<P>>,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider. Fails the same way
    /// `serve` does when the provider cannot produce its schema.
    pub fn new(provider: P) -> Result<Self, ProtocolError> {
        Ok(Self {
            lifecycle: Arc::new(ResourceLifecycle::new(Arc::new(provider))?),
        })
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        self.lifecycle.provider()
    }

    /// Get the lifecycle machine driving the provider.
    pub fn lifecycle(&self) -> &ResourceLifecycle<P> {
        &self.lifecycle
    }

    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Get the provider's schema catalogue.
    pub fn schema(&self) -> &ProviderSchema {
        self.lifecycle.registry().catalogue()
    }

    /// Get the list of resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.lifecycle.registry().resource_types()
    }

    /// Get the list of data source type names.
    pub fn data_source_types(&self) -> Vec<String> {
        self.lifecycle.registry().data_source_types()
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Configure the provider, failing on error diagnostics.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        check_diagnostics(self.lifecycle.configure(config).await?)
    }

    /// Prepare the provider config, returning the prepared value.
    pub async fn prepare_config(&self, config: Value) -> Result<Value, TestError> {
        let (prepared, diagnostics) = self.lifecycle.prepare_config(config).await?;
        check_diagnostics(diagnostics)?;
        Ok(prepared)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        self.lifecycle.stop().await
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate a resource config, failing on error diagnostics.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        check_diagnostics(
            self.lifecycle
                .validate_resource_config(resource_type, config)
                .await?,
        )
    }

    /// Validate a data source config, failing on error diagnostics.
    pub async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        check_diagnostics(
            self.lifecycle
                .validate_data_source_config(data_source_type, config)
                .await?,
        )
    }

    // =========================================================================
    // State Upgrade
    // =========================================================================

    /// Upgrade a stored state from an older schema version.
    pub async fn upgrade_state(
        &self,
        resource_type: &str,
        from_version: u64,
        state: Value,
    ) -> Result<TypedState, ProtocolError> {
        self.lifecycle
            .upgrade_state(resource_type, RawState::new(from_version, state))
    }

    // =========================================================================
    // Plan / Apply
    // =========================================================================

    /// Compute a plan. `prior` is the stored state at the current schema
    /// version, `None` for a create; `config` is the desired configuration,
    /// `Value::Null` for a destroy.
    pub async fn plan(
        &self,
        resource_type: &str,
        key: &str,
        prior: Option<Value>,
        config: Value,
    ) -> Result<Plan, ProtocolError> {
        let instance = InstanceKey::new(resource_type, key);
        let prior = self.raw(resource_type, prior)?;
        self.lifecycle.plan(&instance, prior, config).await
    }

    /// Apply a previously planned change.
    pub async fn apply(
        &self,
        resource_type: &str,
        key: &str,
        prior: Option<Value>,
        planned: Value,
    ) -> Result<ApplyOutcome, ProtocolError> {
        let instance = InstanceKey::new(resource_type, key);
        let prior = self.raw(resource_type, prior)?;
        self.lifecycle.apply(&instance, prior, planned).await
    }

    /// Plan and immediately apply, failing on error diagnostics.
    /// Returns the new state, `None` after a destroy.
    pub async fn plan_then_apply(
        &self,
        resource_type: &str,
        key: &str,
        prior: Option<Value>,
        config: Value,
    ) -> Result<Option<TypedState>, TestError> {
        let plan = self
            .plan(resource_type, key, prior.clone(), config.clone())
            .await?;
        let planned = if config.is_null() {
            Value::Null
        } else {
            plan.planned.to_value()
        };
        let outcome = self.apply(resource_type, key, prior, planned).await?;
        check_diagnostics(outcome.diagnostics)?;
        Ok(outcome.new_state)
    }

    /// Plan and apply a create.
    pub async fn create(
        &self,
        resource_type: &str,
        key: &str,
        config: Value,
    ) -> Result<Option<TypedState>, TestError> {
        self.plan_then_apply(resource_type, key, None, config).await
    }

    /// Plan and apply an update of an existing state.
    pub async fn update(
        &self,
        resource_type: &str,
        key: &str,
        prior: Value,
        config: Value,
    ) -> Result<Option<TypedState>, TestError> {
        self.plan_then_apply(resource_type, key, Some(prior), config)
            .await
    }

    /// Plan and apply a destroy of an existing state.
    pub async fn destroy(
        &self,
        resource_type: &str,
        key: &str,
        prior: Value,
    ) -> Result<(), TestError> {
        let state = self
            .plan_then_apply(resource_type, key, Some(prior), Value::Null)
            .await?;
        assert!(state.is_none(), "destroy left a state behind");
        Ok(())
    }

    // =========================================================================
    // Read / Import / Data sources
    // =========================================================================

    /// Read a resource's current state. `None` means it no longer exists.
    pub async fn read(
        &self,
        resource_type: &str,
        current: Value,
    ) -> Result<Option<TypedState>, ProtocolError> {
        let version = self.lifecycle.registry().current_version(resource_type)?;
        self.lifecycle
            .read(resource_type, RawState::new(version, current))
            .await
    }

    /// Import existing infrastructure by external id.
    pub async fn import(
        &self,
        resource_type: &str,
        key: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProtocolError> {
        let instance = InstanceKey::new(resource_type, key);
        self.lifecycle.import(&instance, id).await
    }

    /// Read a data source, failing on error diagnostics.
    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<TypedState, TestError> {
        let (state, diagnostics) = self
            .lifecycle
            .read_data_source(data_source_type, config)
            .await?;
        check_diagnostics(diagnostics)?;
        Ok(state)
    }

    fn raw(
        &self,
        resource_type: &str,
        value: Option<Value>,
    ) -> Result<Option<RawState>, ProtocolError> {
        match value {
            Some(value) => {
                let version = self.lifecycle.registry().current_version(resource_type)?;
                Ok(Some(RawState::new(version, value)))
            }
            None => Ok(None),
        }
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation failed with error diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a protocol error.
    Protocol(ProtocolError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(detail) = &diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            }
            TestError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProtocolError> for TestError {
    fn from(e: ProtocolError) -> Self {
        TestError::Protocol(e)
    }
}

/// Check diagnostics and return an error if there are any errors.
fn check_diagnostics(diagnostics: Diagnostics) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics
        .into_vec()
        .into_iter()
        .filter(|d| matches!(d.severity, Severity::Error))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a plan contains no changes (no drift).
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_empty(plan: &Plan) {
    assert!(
        plan.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        plan.changes.len(),
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that a plan contains at least one change.
///
/// # Panics
///
/// Panics if the plan has no changes.
pub fn assert_plan_has_changes(plan: &Plan) {
    assert!(
        !plan.changes.is_empty(),
        "Expected plan to have changes, but got no changes"
    );
}

/// Assert that a plan has a change for a specific attribute path.
///
/// # Panics
///
/// Panics if the plan does not have a change for the given path.
pub fn assert_plan_changes_attribute(plan: &Plan, path: &str) {
    let has_change = plan.changes.iter().any(|c| c.path == path);
    assert!(
        has_change,
        "Expected plan to change attribute '{}', but it was not changed. Changed attributes: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that a plan does not have a change for a specific attribute path.
///
/// # Panics
///
/// Panics if the plan has a change for the given path.
pub fn assert_plan_does_not_change_attribute(plan: &Plan, path: &str) {
    let has_change = plan.changes.iter().any(|c| c.path == path);
    assert!(
        !has_change,
        "Expected plan to not change attribute '{}', but it was changed",
        path
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &Diagnostics) {
    let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain at least one error.
///
/// # Panics
///
/// Panics if there are no error diagnostics.
pub fn assert_has_errors(diagnostics: &Diagnostics) {
    assert!(
        diagnostics.has_errors(),
        "Expected at least one error, but got none"
    );
}

/// Assert that diagnostics contain an error with the given summary substring.
///
/// # Panics
///
/// Panics if no error diagnostic contains the given substring.
pub fn assert_error_contains(diagnostics: &Diagnostics, substring: &str) {
    let has_matching_error = diagnostics
        .iter()
        .any(|d| d.is_error() && d.summary.contains(substring));

    assert!(
        has_matching_error,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| d.is_error())
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ApplyFailure;
    use crate::schema::{Attribute, Schema};
    use crate::upgrade::StateUpgraders;
    use serde_json::json;

    struct BucketProvider;

    #[async_trait::async_trait]
    impl ProviderService for BucketProvider {
        fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
            Ok(ProviderSchema::new()
                .with_resource(
                    "bucket",
                    Schema::new(2)
                        .with_attribute("name", Attribute::required_string())
                        .with_attribute(
                            "capacity",
                            Attribute::optional_int64().with_default(json!(1)),
                        )
                        .with_attribute("arn", Attribute::computed_string()),
                )
                .with_data_source(
                    "bucket_lookup",
                    Schema::v0()
                        .with_attribute("name", Attribute::required_string())
                        .with_attribute("arn", Attribute::computed_string()),
                ))
        }

        fn state_upgraders(&self) -> StateUpgraders {
            StateUpgraders::new().register("bucket", 1, |mut state| {
                if let Some(obj) = state.as_object_mut() {
                    if let Some(size) = obj.remove("size") {
                        obj.insert("capacity".to_string(), size);
                    }
                }
                Ok(state)
            })
        }

        async fn configure(&self, _config: Value) -> Result<Vec<Diagnostic>, ProtocolError> {
            Ok(vec![])
        }

        async fn apply(
            &self,
            _resource_type: &str,
            _prior: Option<Value>,
            planned: Value,
        ) -> Result<Value, ApplyFailure> {
            if planned.is_null() {
                return Ok(Value::Null);
            }
            let mut obj = planned.as_object().cloned().unwrap_or_default();
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            obj.insert("arn".to_string(), json!(format!("arn:bucket:{}", name)));
            Ok(Value::Object(obj))
        }

        async fn read(
            &self,
            _resource_type: &str,
            current: Value,
        ) -> Result<Option<Value>, ProtocolError> {
            Ok(Some(current))
        }

        async fn read_data_source(
            &self,
            _data_source_type: &str,
            config: Value,
        ) -> Result<Value, ProtocolError> {
            let mut obj = config.as_object().cloned().unwrap_or_default();
            obj.insert("arn".to_string(), json!("arn:bucket:lookup"));
            Ok(Value::Object(obj))
        }
    }

    async fn tester() -> ProviderTester<BucketProvider> {
        let tester = ProviderTester::new(BucketProvider).unwrap();
        tester.configure(json!({})).await.unwrap();
        tester
    }

    #[tokio::test]
    async fn test_full_create_update_destroy_cycle() {
        let t = tester().await;

        let created = t
            .create("bucket", "a", json!({"name": "data"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.known("arn"), Some(&json!("arn:bucket:data")));
        assert_eq!(created.known("capacity"), Some(&json!(1)));

        let updated = t
            .update(
                "bucket",
                "a",
                created.to_value(),
                json!({"name": "data", "capacity": 3}),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.known("capacity"), Some(&json!(3)));

        t.destroy("bucket", "a", updated.to_value()).await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_assertions() {
        let t = tester().await;
        let prior = json!({"name": "data", "capacity": 1, "arn": "arn:bucket:data"});

        let unchanged = t
            .plan("bucket", "a", Some(prior.clone()), json!({"name": "data", "capacity": 1}))
            .await
            .unwrap();
        assert_plan_empty(&unchanged);

        let changed = t
            .plan("bucket", "a", Some(prior), json!({"name": "data", "capacity": 5}))
            .await
            .unwrap();
        assert_plan_has_changes(&changed);
        assert_plan_changes_attribute(&changed, "capacity");
        assert_plan_does_not_change_attribute(&changed, "name");
    }

    #[tokio::test]
    async fn test_upgrade_state_helper() {
        let t = tester().await;
        let upgraded = t
            .upgrade_state("bucket", 1, json!({"name": "data", "size": 4, "arn": "x"}))
            .await
            .unwrap();
        assert_eq!(upgraded.version, 2);
        assert_eq!(upgraded.known("capacity"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_invalid_config_surfaces_diagnostics() {
        let t = tester().await;
        let err = t
            .validate_resource_config("bucket", json!({"capacity": 2}))
            .await
            .unwrap_err();
        match err {
            TestError::Diagnostics(diags) => {
                assert!(diags.iter().any(|d| d.summary.contains("name")));
            }
            other => panic!("expected diagnostics, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_read_data_source_helper() {
        let t = tester().await;
        let state = t
            .read_data_source("bucket_lookup", json!({"name": "data"}))
            .await
            .unwrap();
        assert_eq!(state.known("arn"), Some(&json!("arn:bucket:lookup")));
    }
}
