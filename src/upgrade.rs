//! The state upgrade engine.
//!
//! Persisted state is tagged with the schema version it was written under.
//! Before any lifecycle operation may consume it, the engine walks it up to
//! the current version through provider-supplied, one-step transformations
//! and then decodes it against the current schema. There is no skip-version
//! shortcut and no downgrade path.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::ProtocolError;
use crate::registry::SchemaRegistry;
use crate::state::{RawState, TypedState};

/// A single version-to-version state transformation.
///
/// Must be a pure, total function over the prior version's valid value
/// space, and idempotent: retries after a partial failure are expected to
/// re-run steps.
pub type UpgradeFn =
    Box<dyn Fn(serde_json::Value) -> Result<serde_json::Value, ProtocolError> + Send + Sync>;

/// The provider-supplied collection of per-version upgrade steps, keyed by
/// (resource type, from-version).
#[derive(Default)]
pub struct StateUpgraders {
    steps: HashMap<(String, u64), UpgradeFn>,
}

impl StateUpgraders {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transformation taking `resource_type` state from
    /// `from_version` to `from_version + 1`.
    ///
    /// The transformation must be idempotent and total over the prior
    /// version's valid values.
    pub fn register<F>(mut self, resource_type: impl Into<String>, from_version: u64, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, ProtocolError>
            + Send
            + Sync
            + 'static,
    {
        self.steps
            .insert((resource_type.into(), from_version), Box::new(f));
        self
    }

    fn step(&self, resource_type: &str, from_version: u64) -> Option<&UpgradeFn> {
        self.steps.get(&(resource_type.to_string(), from_version))
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for StateUpgraders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateUpgraders")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Converts version-tagged raw state into typed state for the current
/// schema. Read-only after construction; shared across all concurrent
/// instance operations in a session.
pub struct UpgradeEngine {
    registry: Arc<SchemaRegistry>,
    upgraders: StateUpgraders,
}

impl UpgradeEngine {
    /// Create an engine over a session's registry and the provider's
    /// registered upgrade steps.
    pub fn new(registry: Arc<SchemaRegistry>, upgraders: StateUpgraders) -> Self {
        Self {
            registry,
            upgraders,
        }
    }

    /// Upgrade raw state to the current schema version and decode it.
    ///
    /// - Already current: a pure decode (re-upgrading is a no-op).
    /// - Newer than current: [`ProtocolError::UnsupportedSchemaVersion`],
    ///   since the stored state outruns the connected provider.
    /// - Older: one-step transformations are applied in version order; a
    ///   missing or failing step yields
    ///   [`ProtocolError::StateUpgradeFailed`] naming the version pair.
    #[instrument(skip(self, raw), fields(version = raw.version))]
    pub fn upgrade(
        &self,
        resource_type: &str,
        raw: RawState,
    ) -> Result<TypedState, ProtocolError> {
        let schema = self.registry.resource(resource_type)?;
        let current = schema.version;

        if raw.version > current {
            return Err(ProtocolError::UnsupportedSchemaVersion {
                resource_type: resource_type.to_string(),
                stored: raw.version,
                current,
            });
        }

        let mut value = raw.state;
        let mut version = raw.version;
        while version < current {
            let step = self.upgraders.step(resource_type, version).ok_or_else(|| {
                ProtocolError::StateUpgradeFailed {
                    resource_type: resource_type.to_string(),
                    from: version,
                    to: version + 1,
                    message: "no upgrade step registered for this version".to_string(),
                }
            })?;

            value = step(value).map_err(|err| ProtocolError::StateUpgradeFailed {
                resource_type: resource_type.to_string(),
                from: version,
                to: version + 1,
                message: err.to_string(),
            })?;

            version += 1;
            debug!(resource_type, version, "state upgraded one step");
        }

        TypedState::decode(schema, &value)
    }
}

impl std::fmt::Debug for UpgradeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeEngine")
            .field("upgraders", &self.upgraders)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, ProviderSchema, Schema};
    use serde_json::json;

    /// Schema history: v1 had `size`, v2 renamed it to `capacity`.
    fn registry_v2() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new(ProviderSchema::new().with_resource(
            "disk",
            Schema::new(2).with_attribute("capacity", Attribute::required_string()),
        )))
    }

    fn rename_size_to_capacity() -> StateUpgraders {
        StateUpgraders::new().register("disk", 1, |mut state| {
            if let Some(obj) = state.as_object_mut() {
                if let Some(size) = obj.remove("size") {
                    obj.insert("capacity".to_string(), size);
                }
            }
            Ok(state)
        })
    }

    #[test]
    fn test_upgrade_applies_rename() {
        let engine = UpgradeEngine::new(registry_v2(), rename_size_to_capacity());

        let raw = RawState::new(1, json!({"size": "10GB"}));
        let typed = engine.upgrade("disk", raw).unwrap();

        assert_eq!(typed.version, 2);
        assert_eq!(typed.known("capacity"), Some(&json!("10GB")));
        assert!(typed.get("size").is_none());
    }

    #[test]
    fn test_upgrade_of_current_state_is_pure_decode() {
        let engine = UpgradeEngine::new(registry_v2(), rename_size_to_capacity());

        let raw = RawState::new(2, json!({"capacity": "10GB"}));
        let typed = engine.upgrade("disk", raw).unwrap();
        assert_eq!(typed.known("capacity"), Some(&json!("10GB")));

        // Feeding the decoded value back through at the current version
        // changes nothing.
        let again = engine
            .upgrade("disk", RawState::new(2, typed.to_value()))
            .unwrap();
        assert_eq!(again, typed);
    }

    #[test]
    fn test_upgrade_chain_matches_stepwise() {
        // Three versions: v0 `bytes` -> v1 `size` -> v2 `capacity`.
        let registry = registry_v2();
        let upgraders = StateUpgraders::new()
            .register("disk", 0, |mut state| {
                if let Some(obj) = state.as_object_mut() {
                    if let Some(b) = obj.remove("bytes") {
                        obj.insert("size".to_string(), b);
                    }
                }
                Ok(state)
            })
            .register("disk", 1, |mut state| {
                if let Some(obj) = state.as_object_mut() {
                    if let Some(size) = obj.remove("size") {
                        obj.insert("capacity".to_string(), size);
                    }
                }
                Ok(state)
            });
        let engine = UpgradeEngine::new(registry, upgraders);

        let chained = engine
            .upgrade("disk", RawState::new(0, json!({"bytes": "10GB"})))
            .unwrap();

        // Stepwise: run v0 state to v1 by hand, then let the engine finish.
        let stepwise = engine
            .upgrade("disk", RawState::new(1, json!({"size": "10GB"})))
            .unwrap();

        assert_eq!(chained, stepwise);
        assert_eq!(chained.known("capacity"), Some(&json!("10GB")));
    }

    #[test]
    fn test_upgrade_rejects_newer_state() {
        let engine = UpgradeEngine::new(registry_v2(), StateUpgraders::new());

        let err = engine
            .upgrade("disk", RawState::new(3, json!({"capacity": "10GB"})))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedSchemaVersion {
                stored: 3,
                current: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_upgrade_missing_step_names_version_pair() {
        let engine = UpgradeEngine::new(registry_v2(), StateUpgraders::new());

        let err = engine
            .upgrade("disk", RawState::new(1, json!({"size": "10GB"})))
            .unwrap_err();
        match err {
            ProtocolError::StateUpgradeFailed { from, to, .. } => {
                assert_eq!((from, to), (1, 2));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_upgrade_failing_step_names_version_pair() {
        let upgraders = StateUpgraders::new().register("disk", 1, |_state| {
            Err(ProtocolError::Provider("cannot parse size".to_string()))
        });
        let engine = UpgradeEngine::new(registry_v2(), upgraders);

        let err = engine
            .upgrade("disk", RawState::new(1, json!({"size": "??"})))
            .unwrap_err();
        match err {
            ProtocolError::StateUpgradeFailed {
                from, to, message, ..
            } => {
                assert_eq!((from, to), (1, 2));
                assert!(message.contains("cannot parse size"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_upgrade_unknown_resource_type() {
        let engine = UpgradeEngine::new(registry_v2(), StateUpgraders::new());
        let err = engine
            .upgrade("volume", RawState::new(0, json!({})))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownResourceType(_)));
    }
}
