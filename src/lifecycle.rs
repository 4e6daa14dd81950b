//! Resource lifecycle state machine.
//!
//! [`ResourceLifecycle`] sits between the wire surface and a
//! [`ProviderService`] implementation. It owns the schema registry, the
//! state upgrade engine, the configure-once gate, and a per-instance lock
//! table, and it enforces the operation ordering the protocol requires:
//! configure before resource operations, plan before apply, a plan only
//! applied against the exact prior state it was computed from.
//!
//! Each managed instance admits one in-flight operation at a time;
//! operations on different instances proceed concurrently. A lock that
//! cannot be taken immediately yields [`ProtocolError::TransientBusy`] so
//! the caller can back off instead of queueing unboundedly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::ProtocolError;
use crate::provider::ProviderService;
use crate::registry::SchemaRegistry;
use crate::schema::Schema;
use crate::state::{AttrValue, RawState, TypedState};
use crate::types::{AttributeChange, ImportedResource, Plan, StopSignal};
use crate::upgrade::UpgradeEngine;
use crate::validation;

/// Where an instance currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No provider configuration has been accepted yet.
    Unconfigured,
    /// Provider configured; the instance is at rest.
    Configured,
    /// A plan is being computed.
    Planning,
    /// A plan exists and is awaiting apply.
    Planned,
    /// A planned change is executing.
    Applying,
    /// Existing infrastructure is being imported.
    Importing,
}

/// Identifies one managed resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// The resource type, e.g. `"example_instance"`.
    pub resource_type: String,
    /// Caller-chosen key distinguishing instances of the same type.
    pub key: String,
}

impl InstanceKey {
    /// Create an instance key.
    pub fn new(resource_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.key)
    }
}

/// Per-instance bookkeeping. On any operation failure the instance keeps
/// its last known-good state; a half-written one is never recorded.
#[derive(Debug)]
struct Instance {
    phase: Phase,
    state: Option<TypedState>,
    plan: Option<Plan>,
}

impl Instance {
    fn new() -> Self {
        Self {
            phase: Phase::Configured,
            state: None,
            plan: None,
        }
    }
}

/// The outcome of an apply: the state to persist (if any survives) plus
/// diagnostics accumulated along the way.
///
/// A partial failure is still an `Ok` outcome at this level: the
/// best-known state and the error diagnostics travel together so neither
/// is lost. `new_state: None` with no error diagnostics means the resource
/// was destroyed.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The state to persist, `None` after a destroy.
    pub new_state: Option<TypedState>,
    /// Errors and warnings produced by the apply.
    pub diagnostics: Diagnostics,
}

/// The lifecycle state machine driving a [`ProviderService`].
pub struct ResourceLifecycle<P: ProviderService> {
    provider: Arc<P>,
    registry: Arc<SchemaRegistry>,
    upgrade: UpgradeEngine,
    stop: StopSignal,
    configured: Mutex<bool>,
    instances: Mutex<HashMap<InstanceKey, Arc<tokio::sync::Mutex<Instance>>>>,
}

impl<P: ProviderService> std::fmt::Debug for ResourceLifecycle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLifecycle")
            .field("upgrade", &self.upgrade)
            .finish_non_exhaustive()
    }
}

impl<P: ProviderService> ResourceLifecycle<P> {
    /// Build the lifecycle for a provider. Fails with
    /// [`ProtocolError::SchemaUnavailable`] when the provider cannot
    /// produce its schema; nothing else can proceed without one.
    pub fn new(provider: Arc<P>) -> Result<Self, ProtocolError> {
        let catalogue = provider
            .schema()
            .map_err(|e| ProtocolError::SchemaUnavailable(e.to_string()))?;
        let registry = Arc::new(SchemaRegistry::new(catalogue));
        let upgrade = UpgradeEngine::new(Arc::clone(&registry), provider.state_upgraders());
        Ok(Self {
            provider,
            registry,
            upgrade,
            stop: StopSignal::new(),
            configured: Mutex::new(false),
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// The schema registry built from the provider's catalogue.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The cooperative stop handle.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// The provider being driven.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn check_configured(&self, op: &str) -> Result<(), ProtocolError> {
        if *self.configured.lock().unwrap_or_else(|e| e.into_inner()) {
            Ok(())
        } else {
            Err(ProtocolError::NotConfigured(format!(
                "{} called before Configure",
                op
            )))
        }
    }

    fn check_stopping(&self) -> Result<(), ProtocolError> {
        if self.stop.is_stopped() {
            Err(ProtocolError::Stopping)
        } else {
            Ok(())
        }
    }

    /// Take the per-instance lock, creating the slot on first touch.
    fn lock_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<tokio::sync::OwnedMutexGuard<Instance>, ProtocolError> {
        let slot = {
            let mut table = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                table
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Instance::new()))),
            )
        };
        slot.try_lock_owned().map_err(|_| {
            ProtocolError::TransientBusy(format!("operation already in flight for {}", key))
        })
    }

    // =========================================================================
    // Provider lifecycle
    // =========================================================================

    /// Prepare the provider configuration without configuring.
    #[instrument(skip(self, config))]
    pub async fn prepare_config(
        &self,
        config: Value,
    ) -> Result<(Value, Diagnostics), ProtocolError> {
        let schema = self.registry.provider_config_schema();
        let mut diags = Diagnostics::from(validation::validate(schema, &config));
        if diags.has_errors() {
            return Ok((config, diags));
        }
        let (prepared, more) = self.provider.prepare_config(config).await?;
        diags.extend(more);
        Ok((prepared, diags))
    }

    /// Configure the provider. Succeeds at most once per session.
    #[instrument(skip(self, config))]
    pub async fn configure(&self, config: Value) -> Result<Diagnostics, ProtocolError> {
        self.check_stopping()?;
        if *self.configured.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(ProtocolError::AlreadyConfigured);
        }

        let (prepared, mut diags) = self.prepare_config(config).await?;
        if diags.has_errors() {
            return Ok(diags);
        }
        diags.extend(self.provider.configure(prepared).await?);
        if !diags.has_errors() {
            *self.configured.lock().unwrap_or_else(|e| e.into_inner()) = true;
            info!("provider configured");
        }
        Ok(diags)
    }

    /// Trigger graceful stop: flip the signal, then let the provider
    /// release whatever it holds. A no-op stop is success.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        self.stop.stop();
        self.provider.stop().await
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate a resource configuration. Side-effect free, any phase.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Diagnostics, ProtocolError> {
        let schema = self.registry.resource(resource_type)?;
        let mut diags = Diagnostics::from(validation::validate(schema, &config));
        if !diags.has_errors() {
            diags.extend(
                self.provider
                    .validate_resource_config(resource_type, config)
                    .await?,
            );
        }
        Ok(diags)
    }

    /// Validate a data source configuration. Side-effect free, any phase.
    pub async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Diagnostics, ProtocolError> {
        let schema = self.registry.data_source(data_source_type)?;
        let mut diags = Diagnostics::from(validation::validate(schema, &config));
        if !diags.has_errors() {
            diags.extend(
                self.provider
                    .validate_data_source_config(data_source_type, config)
                    .await?,
            );
        }
        Ok(diags)
    }

    // =========================================================================
    // State upgrade
    // =========================================================================

    /// Bring a stored state up to the current schema version.
    pub fn upgrade_state(
        &self,
        resource_type: &str,
        raw: RawState,
    ) -> Result<TypedState, ProtocolError> {
        self.upgrade.upgrade(resource_type, raw)
    }

    // =========================================================================
    // Plan
    // =========================================================================

    /// Compute a plan for one instance.
    ///
    /// `prior` is the stored state (`None` when the resource does not exist
    /// yet); `config` is the desired configuration, `Value::Null` to
    /// destroy. The plan is deterministic for unchanged inputs and is
    /// retained on the instance for the apply that follows.
    #[instrument(skip(self, prior, config), fields(key = %key))]
    pub async fn plan(
        &self,
        key: &InstanceKey,
        prior: Option<RawState>,
        config: Value,
    ) -> Result<Plan, ProtocolError> {
        self.check_stopping()?;
        self.check_configured("PlanResourceChange")?;
        let schema = self.registry.resource(&key.resource_type)?.clone();
        let mut instance = self.lock_instance(key)?;
        instance.phase = Phase::Planning;

        let result = self.plan_inner(key, &schema, prior, config).await;
        match &result {
            Ok(plan) => {
                instance.plan = Some(plan.clone());
                instance.phase = Phase::Planned;
                debug!(changes = plan.changes.len(), "plan computed");
            }
            Err(err) => {
                instance.plan = None;
                instance.phase = Phase::Configured;
                warn!(error = %err, "plan failed");
            }
        }
        result
    }

    async fn plan_inner(
        &self,
        key: &InstanceKey,
        schema: &Schema,
        prior: Option<RawState>,
        config: Value,
    ) -> Result<Plan, ProtocolError> {
        let prior_typed = prior
            .map(|raw| self.upgrade.upgrade(&key.resource_type, raw))
            .transpose()?;

        // Destroy plan: no proposed state, a Delete per prior attribute.
        if config.is_null() {
            let planned = TypedState {
                version: schema.version,
                values: Default::default(),
            };
            let changes = match &prior_typed {
                Some(prior) => prior
                    .values
                    .iter()
                    .map(|(name, before)| AttributeChange::deleted(name.clone(), before.clone()))
                    .collect(),
                None => Vec::new(),
            };
            return Ok(Plan {
                resource_type: key.resource_type.clone(),
                prior: prior_typed,
                planned,
                changes,
            });
        }

        let config_diags = validation::validate(schema, &config);
        if let Some(err) = config_diags.iter().find(|d| d.is_error()) {
            return Err(ProtocolError::Validation(err.summary.clone()));
        }

        let proposed = self
            .provider
            .propose(
                &key.resource_type,
                prior_typed.as_ref().map(TypedState::to_value),
                config.clone(),
            )
            .await?;

        // A proposal that drops a required attribute is a provider bug, not
        // something to repair silently from config.
        if let Some(proposal) = proposed.as_object() {
            for name in schema.required_attributes() {
                if matches!(proposal.get(name), None | Some(Value::Null)) {
                    return Err(ProtocolError::InvalidPlan(format!(
                        "proposal for {} drops required attribute `{}`",
                        key.resource_type, name
                    )));
                }
            }
        }

        let planned = merge_planned(schema, &config, &proposed, prior_typed.as_ref())?;

        let changes = diff_states(prior_typed.as_ref(), &planned);
        Ok(Plan {
            resource_type: key.resource_type.clone(),
            prior: prior_typed,
            planned,
            changes,
        })
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Execute the plan previously computed for this instance.
    ///
    /// `prior` and `planned` must match the stored plan exactly; anything
    /// else means the world moved since planning and yields
    /// [`ProtocolError::StalePlan`] with nothing applied.
    #[instrument(skip(self, prior, planned), fields(key = %key))]
    pub async fn apply(
        &self,
        key: &InstanceKey,
        prior: Option<RawState>,
        planned: Value,
    ) -> Result<ApplyOutcome, ProtocolError> {
        self.check_stopping()?;
        self.check_configured("ApplyResourceChange")?;
        let schema = self.registry.resource(&key.resource_type)?.clone();
        let mut instance = self.lock_instance(key)?;

        let plan = instance
            .plan
            .take()
            .ok_or_else(|| ProtocolError::StalePlan(format!("no plan recorded for {}", key)))?;

        let prior_typed = match prior
            .map(|raw| self.upgrade.upgrade(&key.resource_type, raw))
            .transpose()
        {
            Ok(typed) => typed,
            Err(e) => {
                instance.phase = Phase::Configured;
                return Err(e);
            }
        };
        if prior_typed != plan.prior {
            instance.phase = Phase::Configured;
            return Err(ProtocolError::StalePlan(format!(
                "prior state for {} changed since the plan was computed",
                key
            )));
        }
        let destroying = planned.is_null();
        if !destroying {
            let planned_typed = match TypedState::decode(&schema, &planned) {
                Ok(typed) => typed,
                Err(e) => {
                    instance.phase = Phase::Configured;
                    return Err(e);
                }
            };
            if planned_typed != plan.planned {
                instance.phase = Phase::Configured;
                return Err(ProtocolError::StalePlan(format!(
                    "planned state for {} does not match the recorded plan",
                    key
                )));
            }
        } else if !plan.planned.values.is_empty() {
            instance.phase = Phase::Configured;
            return Err(ProtocolError::StalePlan(format!(
                "recorded plan for {} is not a destroy",
                key
            )));
        }

        instance.phase = Phase::Applying;
        let prior_value = prior_typed.as_ref().map(TypedState::to_value);
        let outcome = match self
            .provider
            .apply(&key.resource_type, prior_value, planned)
            .await
        {
            Ok(Value::Null) if destroying => {
                instance.state = None;
                info!("resource destroyed");
                ApplyOutcome {
                    new_state: None,
                    diagnostics: Diagnostics::new(),
                }
            }
            Ok(new_value) => {
                let new_state = match TypedState::decode(&schema, &new_value) {
                    Ok(state) => state,
                    Err(err) => {
                        instance.phase = Phase::Configured;
                        return Err(err);
                    }
                };
                if !new_state.is_fully_known() {
                    instance.phase = Phase::Configured;
                    return Err(ProtocolError::Provider(format!(
                        "apply for {} returned unknown attribute values",
                        key.resource_type
                    )));
                }
                instance.state = Some(new_state.clone());
                info!("apply complete");
                ApplyOutcome {
                    new_state: Some(new_state),
                    diagnostics: Diagnostics::new(),
                }
            }
            Err(failure) => {
                let mut diagnostics = Diagnostics::new();
                diagnostics.push(Diagnostic::from(ProtocolError::PartialApply(
                    failure.error.to_string(),
                )));
                // Keep whatever state survived, but only if the schema
                // still recognizes it. Otherwise the last known-good
                // state stands.
                let new_state = failure
                    .partial_state
                    .and_then(|v| TypedState::decode(&schema, &v).ok());
                if let Some(state) = &new_state {
                    instance.state = Some(state.clone());
                    warn!("apply failed with partial state retained");
                } else {
                    warn!("apply failed, no partial state");
                }
                ApplyOutcome {
                    new_state: new_state.or_else(|| instance.state.clone()),
                    diagnostics,
                }
            }
        };
        instance.phase = Phase::Configured;
        Ok(outcome)
    }

    // =========================================================================
    // Read / Import / Data sources
    // =========================================================================

    /// Refresh the current state of a resource from the real system.
    /// `Ok(None)` means the resource is gone, which is a valid outcome.
    #[instrument(skip(self, current))]
    pub async fn read(
        &self,
        resource_type: &str,
        current: RawState,
    ) -> Result<Option<TypedState>, ProtocolError> {
        self.check_configured("ReadResource")?;
        let schema = self.registry.resource(resource_type)?.clone();
        let typed = self.upgrade.upgrade(resource_type, current)?;
        match self
            .provider
            .read(resource_type, typed.to_value())
            .await?
        {
            Some(value) => Ok(Some(TypedState::decode(&schema, &value)?)),
            None => Ok(None),
        }
    }

    /// Import existing infrastructure under the given instance key.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn import(
        &self,
        key: &InstanceKey,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProtocolError> {
        self.check_stopping()?;
        self.check_configured("ImportResourceState")?;
        self.registry.resource(&key.resource_type)?;
        let mut instance = self.lock_instance(key)?;
        instance.phase = Phase::Importing;

        let result = self.import_inner(key, id).await;
        if let Ok(imported) = &result {
            // The first state for the requested type becomes the instance's.
            if let Some(first) = imported
                .iter()
                .find(|r| r.resource_type == key.resource_type)
            {
                let schema = self.registry.resource(&key.resource_type)?;
                instance.state = Some(TypedState::decode(schema, &first.state)?);
            }
            info!(count = imported.len(), "import complete");
        }
        instance.phase = Phase::Configured;
        result
    }

    async fn import_inner(
        &self,
        key: &InstanceKey,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProtocolError> {
        let imported = self.provider.import(&key.resource_type, id).await?;
        // Round-trip every imported state through its schema so malformed
        // provider output surfaces here, not at the next plan.
        imported
            .into_iter()
            .map(|r| {
                let schema = self.registry.resource(&r.resource_type)?;
                let typed = TypedState::decode(schema, &r.state)?;
                Ok(ImportedResource::new(r.resource_type, typed.to_value()))
            })
            .collect()
    }

    /// Read a data source. Data sources have no lifecycle; the result is
    /// computed on every read.
    #[instrument(skip(self, config))]
    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<(TypedState, Diagnostics), ProtocolError> {
        self.check_configured("ReadDataSource")?;
        let schema = self.registry.data_source(data_source_type)?.clone();
        let diags = Diagnostics::from(validation::validate(&schema, &config));
        if diags.has_errors() {
            let first = diags.iter().find(|d| d.is_error()).map(|d| d.summary.clone());
            return Err(ProtocolError::Validation(first.unwrap_or_default()));
        }
        let value = self
            .provider
            .read_data_source(data_source_type, config)
            .await?;
        Ok((TypedState::decode(&schema, &value)?, diags))
    }
}

/// Merge config, provider proposal, prior state, and schema defaults into
/// the planned state. Tie-break, in order: explicit config value, provider
/// proposal, prior value for computed attributes, schema default, Unknown
/// for computed, absent for unset optionals.
fn merge_planned(
    schema: &Schema,
    config: &Value,
    proposed: &Value,
    prior: Option<&TypedState>,
) -> Result<TypedState, ProtocolError> {
    let config_obj = config.as_object();
    let proposed_obj = proposed.as_object();
    let mut values = std::collections::BTreeMap::new();

    for (name, attr) in &schema.attributes {
        // An explicit null is the same as unset, matching validation.
        let from_config = config_obj.and_then(|o| o.get(name)).filter(|v| !v.is_null());
        let from_proposed = proposed_obj.and_then(|o| o.get(name)).filter(|v| !v.is_null());

        let value = if let Some(v) = from_config {
            Some(AttrValue::from_wire(v.clone()))
        } else if let Some(v) = from_proposed {
            Some(AttrValue::from_wire(v.clone()))
        } else if attr.flags.computed {
            match prior.and_then(|p| p.get(name)) {
                Some(v) => Some(v.clone()),
                None => Some(AttrValue::Unknown),
            }
        } else if let Some(default) = &attr.default {
            Some(AttrValue::known(default.clone()))
        } else {
            None
        };
        if let Some(value) = value {
            values.insert(name.clone(), value);
        }
    }

    let merged = TypedState {
        version: schema.version,
        values,
    };
    // Re-decode to type-check known values the provider proposal injected.
    TypedState::decode(schema, &merged.to_value())
}

/// Attribute-level diff between prior and planned. `NoOp` pairs are
/// excluded, so an empty diff means no drift.
fn diff_states(prior: Option<&TypedState>, planned: &TypedState) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    match prior {
        None => {
            for (name, after) in &planned.values {
                changes.push(AttributeChange::created(name.clone(), after.clone()));
            }
        }
        Some(prior) => {
            // Union of attribute names in BTreeMap order keeps the diff
            // deterministic.
            let names: std::collections::BTreeSet<&String> =
                prior.values.keys().chain(planned.values.keys()).collect();
            for name in names {
                match (prior.values.get(name), planned.values.get(name)) {
                    (Some(before), Some(after)) if before == after => {}
                    (Some(before), Some(after)) => changes.push(AttributeChange::updated(
                        name.clone(),
                        before.clone(),
                        after.clone(),
                    )),
                    (None, Some(after)) => {
                        changes.push(AttributeChange::created(name.clone(), after.clone()))
                    }
                    (Some(before), None) => {
                        changes.push(AttributeChange::deleted(name.clone(), before.clone()))
                    }
                    (None, None) => unreachable!(),
                }
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ApplyFailure;
    use crate::schema::{Attribute, ProviderSchema};
    use crate::upgrade::StateUpgraders;
    use serde_json::json;

    /// A provider managing a single "server" resource with a computed id.
    struct ServerProvider;

    #[async_trait::async_trait]
    impl ProviderService for ServerProvider {
        fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
            Ok(ProviderSchema::new()
                .with_resource(
                    "server",
                    Schema::new(2)
                        .with_attribute("name", Attribute::required_string())
                        .with_attribute(
                            "capacity",
                            Attribute::optional_int64().with_default(json!(1)),
                        )
                        .with_attribute("id", Attribute::computed_string()),
                )
                .with_data_source(
                    "server_lookup",
                    Schema::v0()
                        .with_attribute("name", Attribute::required_string())
                        .with_attribute("id", Attribute::computed_string()),
                ))
        }

        fn state_upgraders(&self) -> StateUpgraders {
            // v1 named the capacity attribute `size`.
            StateUpgraders::new().register("server", 1, |mut state| {
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
            obj.insert("id".to_string(), json!("srv-42"));
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
            obj.insert("id".to_string(), json!("srv-42"));
            Ok(Value::Object(obj))
        }
    }

    async fn configured_lifecycle() -> ResourceLifecycle<ServerProvider> {
        let lifecycle = ResourceLifecycle::new(Arc::new(ServerProvider)).unwrap();
        let diags = lifecycle.configure(json!({})).await.unwrap();
        assert!(!diags.has_errors());
        lifecycle
    }

    fn planned_wire(plan: &Plan) -> Value {
        plan.planned.to_value()
    }

    #[tokio::test]
    async fn test_resource_ops_require_configure() {
        let lifecycle = ResourceLifecycle::new(Arc::new(ServerProvider)).unwrap();
        let key = InstanceKey::new("server", "a");
        let err = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_configure_twice_rejected() {
        let lifecycle = configured_lifecycle().await;
        let err = lifecycle.configure(json!({})).await.unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyConfigured));
    }

    #[tokio::test]
    async fn test_create_plan_marks_computed_unknown() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let plan = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap();

        assert_eq!(plan.planned.get("id"), Some(&AttrValue::Unknown));
        assert_eq!(plan.planned.known("capacity"), Some(&json!(1)));
        assert_eq!(plan.changes.len(), 3);
    }

    #[tokio::test]
    async fn test_null_optional_in_config_plans_like_unset() {
        let lifecycle = configured_lifecycle().await;
        let config = json!({"name": "web", "capacity": null});

        // Validation treats an explicit null as absent, so planning must too.
        let diags = lifecycle
            .validate_resource_config("server", config.clone())
            .await
            .unwrap();
        assert!(!diags.has_errors());

        let key = InstanceKey::new("server", "a");
        let plan = lifecycle.plan(&key, None, config).await.unwrap();
        assert_eq!(plan.planned.known("capacity"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_proposal_dropping_required_attr_is_invalid() {
        struct TrimmingProvider;

        #[async_trait::async_trait]
        impl ProviderService for TrimmingProvider {
            fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
                ServerProvider.schema()
            }

            async fn configure(&self, _config: Value) -> Result<Vec<Diagnostic>, ProtocolError> {
                Ok(vec![])
            }

            async fn propose(
                &self,
                _resource_type: &str,
                _prior: Option<Value>,
                config: Value,
            ) -> Result<Value, ProtocolError> {
                let mut obj = config.as_object().cloned().unwrap_or_default();
                obj.remove("name");
                Ok(Value::Object(obj))
            }

            async fn apply(
                &self,
                _resource_type: &str,
                _prior: Option<Value>,
                planned: Value,
            ) -> Result<Value, ApplyFailure> {
                Ok(planned)
            }

            async fn read(
                &self,
                _resource_type: &str,
                current: Value,
            ) -> Result<Option<Value>, ProtocolError> {
                Ok(Some(current))
            }
        }

        let lifecycle = ResourceLifecycle::new(Arc::new(TrimmingProvider)).unwrap();
        lifecycle.configure(json!({})).await.unwrap();

        let key = InstanceKey::new("server", "a");
        let err = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn test_plan_then_apply_resolves_unknowns() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let plan = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap();
        let outcome = lifecycle
            .apply(&key, None, planned_wire(&plan))
            .await
            .unwrap();

        assert!(!outcome.diagnostics.has_errors());
        let state = outcome.new_state.unwrap();
        assert!(state.is_fully_known());
        assert_eq!(state.known("id"), Some(&json!("srv-42")));
    }

    #[tokio::test]
    async fn test_update_plan_diff_excludes_unchanged() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let prior = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );

        let plan = lifecycle
            .plan(&key, Some(prior), json!({"name": "web", "capacity": 3}))
            .await
            .unwrap();

        assert_eq!(plan.changes.len(), 1);
        let change = plan.change("capacity").unwrap();
        assert_eq!(change.action, crate::types::ChangeAction::Update);
        assert_eq!(change.before, Some(AttrValue::known(json!(1))));
        assert_eq!(change.after, Some(AttrValue::known(json!(3))));
        // Unset computed attribute carries over from prior, not Unknown.
        assert_eq!(plan.planned.known("id"), Some(&json!("srv-42")));
    }

    #[tokio::test]
    async fn test_unchanged_config_plans_empty() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let prior = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );

        let plan = lifecycle
            .plan(&key, Some(prior), json!({"name": "web", "capacity": 1}))
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_plan_upgrades_prior_state_first() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        // Stored under v1, where capacity was called `size`.
        let prior = RawState::new(1, json!({"name": "web", "size": 2, "id": "srv-42"}));

        let plan = lifecycle
            .plan(&key, Some(prior), json!({"name": "web", "capacity": 2}))
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_apply_without_plan_is_stale() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let err = lifecycle
            .apply(&key, None, json!({"name": "web", "capacity": 1, "id": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StalePlan(_)));
    }

    #[tokio::test]
    async fn test_apply_with_changed_prior_is_stale() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let prior = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );
        let plan = lifecycle
            .plan(&key, Some(prior), json!({"name": "web", "capacity": 3}))
            .await
            .unwrap();

        // Someone else changed capacity between plan and apply.
        let moved = RawState::new(
            2,
            json!({"name": "web", "capacity": 2, "id": "srv-42"}),
        );
        let err = lifecycle
            .apply(&key, Some(moved), planned_wire(&plan))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StalePlan(_)));
    }

    #[tokio::test]
    async fn test_apply_with_undecodable_planned_resets_phase() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap();

        // Wrong type for capacity, so the payload fails to decode.
        let err = lifecycle
            .apply(&key, None, json!({"name": "web", "capacity": "big", "id": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Validation(_)));

        let slot = Arc::clone(
            lifecycle
                .instances
                .lock()
                .unwrap()
                .get(&key)
                .expect("instance slot"),
        );
        let instance = slot.try_lock().unwrap();
        assert_eq!(instance.phase, Phase::Configured);
        assert!(instance.plan.is_none());
    }

    #[tokio::test]
    async fn test_destroy_plan_and_apply() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let prior = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );

        let plan = lifecycle
            .plan(&key, Some(prior.clone()), Value::Null)
            .await
            .unwrap();
        assert_eq!(plan.changes.len(), 3);
        assert!(plan
            .changes
            .iter()
            .all(|c| c.action == crate::types::ChangeAction::Delete));

        let outcome = lifecycle
            .apply(&key, Some(prior), Value::Null)
            .await
            .unwrap();
        assert!(outcome.new_state.is_none());
        assert!(!outcome.diagnostics.has_errors());
    }

    #[tokio::test]
    async fn test_partial_apply_keeps_best_known_state() {
        struct FlakyProvider;

        #[async_trait::async_trait]
        impl ProviderService for FlakyProvider {
            fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
                ServerProvider.schema()
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
                // The name change landed before the failure.
                let mut obj = planned.as_object().cloned().unwrap_or_default();
                obj.insert("id".to_string(), json!("srv-42"));
                obj.insert("capacity".to_string(), json!(1));
                Err(ApplyFailure::partial(
                    Value::Object(obj),
                    ProtocolError::Provider("capacity change rejected upstream".into()),
                ))
            }

            async fn read(
                &self,
                _resource_type: &str,
                current: Value,
            ) -> Result<Option<Value>, ProtocolError> {
                Ok(Some(current))
            }
        }

        let lifecycle = ResourceLifecycle::new(Arc::new(FlakyProvider)).unwrap();
        lifecycle.configure(json!({})).await.unwrap();
        let key = InstanceKey::new("server", "a");
        let prior = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );

        let plan = lifecycle
            .plan(&key, Some(prior.clone()), json!({"name": "web2", "capacity": 3}))
            .await
            .unwrap();
        let outcome = lifecycle
            .apply(&key, Some(prior), plan.planned.to_value())
            .await
            .unwrap();

        assert!(outcome.diagnostics.has_errors());
        let state = outcome.new_state.unwrap();
        assert_eq!(state.known("name"), Some(&json!("web2")));
        assert_eq!(state.known("capacity"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_instances_do_not_block_each_other() {
        let lifecycle = Arc::new(configured_lifecycle().await);
        let a = InstanceKey::new("server", "a");
        let b = InstanceKey::new("server", "b");

        let plan_a = lifecycle.plan(&a, None, json!({"name": "a"}));
        let plan_b = lifecycle.plan(&b, None, json!({"name": "b"}));
        let (ra, rb) = tokio::join!(plan_a, plan_b);
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }

    #[tokio::test]
    async fn test_locked_instance_reports_busy() {
        let lifecycle = configured_lifecycle().await;
        let key = InstanceKey::new("server", "a");
        let _guard = lifecycle.lock_instance(&key).unwrap();
        let err = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TransientBusy(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stop_blocks_new_plans() {
        let lifecycle = configured_lifecycle().await;
        lifecycle.stop().await.unwrap();
        let key = InstanceKey::new("server", "a");
        let err = lifecycle
            .plan(&key, None, json!({"name": "web"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Stopping));
    }

    #[tokio::test]
    async fn test_read_gone_resource_is_none() {
        struct GoneProvider;

        #[async_trait::async_trait]
        impl ProviderService for GoneProvider {
            fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
                ServerProvider.schema()
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
                Ok(planned)
            }

            async fn read(
                &self,
                _resource_type: &str,
                _current: Value,
            ) -> Result<Option<Value>, ProtocolError> {
                Ok(None)
            }
        }

        let lifecycle = ResourceLifecycle::new(Arc::new(GoneProvider)).unwrap();
        lifecycle.configure(json!({})).await.unwrap();
        let current = RawState::new(
            2,
            json!({"name": "web", "capacity": 1, "id": "srv-42"}),
        );
        let read = lifecycle.read("server", current).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_read_data_source() {
        let lifecycle = configured_lifecycle().await;
        let (state, diags) = lifecycle
            .read_data_source("server_lookup", json!({"name": "web"}))
            .await
            .unwrap();
        assert!(!diags.has_errors());
        assert_eq!(state.known("id"), Some(&json!("srv-42")));
    }

    #[tokio::test]
    async fn test_import_round_trips_state() {
        struct ImportingProvider;

        #[async_trait::async_trait]
        impl ProviderService for ImportingProvider {
            fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
                ServerProvider.schema()
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
                Ok(planned)
            }

            async fn read(
                &self,
                _resource_type: &str,
                current: Value,
            ) -> Result<Option<Value>, ProtocolError> {
                Ok(Some(current))
            }

            async fn import(
                &self,
                resource_type: &str,
                id: &str,
            ) -> Result<Vec<ImportedResource>, ProtocolError> {
                Ok(vec![ImportedResource::new(
                    resource_type,
                    json!({"name": "imported", "capacity": 2, "id": id}),
                )])
            }
        }

        let lifecycle = ResourceLifecycle::new(Arc::new(ImportingProvider)).unwrap();
        lifecycle.configure(json!({})).await.unwrap();
        let key = InstanceKey::new("server", "a");
        let imported = lifecycle.import(&key, "srv-7").await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].state["id"], json!("srv-7"));
    }

    #[tokio::test]
    async fn test_schema_unavailable_is_session_fatal() {
        struct BrokenProvider;

        #[async_trait::async_trait]
        impl ProviderService for BrokenProvider {
            fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
                Err(ProtocolError::Provider("catalogue corrupted".into()))
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
                Ok(planned)
            }

            async fn read(
                &self,
                _resource_type: &str,
                current: Value,
            ) -> Result<Option<Value>, ProtocolError> {
                Ok(Some(current))
            }
        }

        let err = ResourceLifecycle::new(Arc::new(BrokenProvider)).unwrap_err();
        assert!(matches!(err, ProtocolError::SchemaUnavailable(_)));
        assert!(err.is_fatal_for_session());
    }
}
