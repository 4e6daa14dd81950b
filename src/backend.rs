//! State backend collaborator interface.
//!
//! The lifecycle machine produces states; where they live between sessions
//! is someone else's problem. [`StateBackend`] is the seam for that
//! collaborator: refresh before reading, persist after mutating. The core
//! makes no durability promises of its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::state::RawState;

/// A named output value exposed from a state snapshot.
///
/// Sensitive outputs keep their values in memory but carry the flag so the
/// presentation layer can mask them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    /// The output's value.
    pub value: Value,
    /// Whether the value must be masked when displayed.
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputValue {
    /// A plain output value.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            sensitive: false,
        }
    }

    /// A sensitive output value.
    pub fn sensitive(value: Value) -> Self {
        Self {
            value,
            sensitive: true,
        }
    }
}

/// A point-in-time view of everything a backend holds: resource states
/// keyed by instance address, plus named outputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Resource states keyed by `<resource_type>.<key>`.
    pub resources: BTreeMap<String, RawState>,
    outputs: BTreeMap<String, OutputValue>,
}

impl StateSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource state under its instance address.
    pub fn with_resource(mut self, address: impl Into<String>, state: RawState) -> Self {
        self.resources.insert(address.into(), state);
        self
    }

    /// Record a named output.
    pub fn with_output(mut self, name: impl Into<String>, output: OutputValue) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    /// Read-only view of the outputs, sensitive flags preserved.
    pub fn outputs(&self) -> &BTreeMap<String, OutputValue> {
        &self.outputs
    }
}

/// Where snapshots come from and go to.
#[async_trait::async_trait]
pub trait StateBackend: Send + Sync {
    /// Re-read the backend's source of truth. Call before `current_state`
    /// when freshness matters.
    async fn refresh(&self) -> Result<(), ProtocolError>;

    /// The latest snapshot the backend knows about.
    async fn current_state(&self) -> Result<StateSnapshot, ProtocolError>;

    /// Persist a snapshot.
    async fn persist(&self, snapshot: StateSnapshot) -> Result<(), ProtocolError>;
}

/// In-process backend for tests and local single-session runs. `refresh`
/// is a no-op; there is no remote source of truth to re-read.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: std::sync::Mutex<StateSnapshot>,
}

impl MemoryBackend {
    /// An empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateBackend for MemoryBackend {
    async fn refresh(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn current_state(&self) -> Result<StateSnapshot, ProtocolError> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn persist(&self, snapshot: StateSnapshot) -> Result<(), ProtocolError> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        let snapshot = StateSnapshot::new()
            .with_resource("server.a", RawState::new(2, json!({"name": "web"})))
            .with_output("address", OutputValue::new(json!("10.0.0.1")));

        backend.persist(snapshot.clone()).await.unwrap();
        backend.refresh().await.unwrap();
        let read = backend.current_state().await.unwrap();
        assert_eq!(read, snapshot);
    }

    #[tokio::test]
    async fn test_sensitive_output_flag_survives() {
        let backend = MemoryBackend::new();
        let snapshot =
            StateSnapshot::new().with_output("password", OutputValue::sensitive(json!("hunter2")));
        backend.persist(snapshot).await.unwrap();

        let read = backend.current_state().await.unwrap();
        let output = &read.outputs()["password"];
        assert!(output.sensitive);
        assert_eq!(output.value, json!("hunter2"));
    }

    #[test]
    fn test_snapshot_serializes_outputs() {
        let snapshot = StateSnapshot::new()
            .with_output("address", OutputValue::new(json!("10.0.0.1")));
        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded["outputs"]["address"]["value"], json!("10.0.0.1"));
    }
}
