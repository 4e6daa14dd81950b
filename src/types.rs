//! Plan, diff, and convenience types for the protocol.
//!
//! These types provide a more ergonomic API over the raw protobuf types.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::state::{AttrValue, TypedState};

/// What a single attribute change does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// The attribute gains a value it did not have.
    Create,
    /// The attribute's value changes.
    Update,
    /// The attribute loses its value.
    Delete,
    /// The attribute is unchanged. Never stored in a diff; present for
    /// plan/apply agreement checks.
    NoOp,
}

/// A change to a single attribute in a plan's diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// What the change does.
    pub action: ChangeAction,
    /// The value before the change (`None` if the attribute did not exist).
    pub before: Option<AttrValue>,
    /// The value after the change (`None` if the attribute is removed).
    /// May be [`AttrValue::Unknown`] when the value is known only after
    /// apply.
    pub after: Option<AttrValue>,
}

impl AttributeChange {
    /// Create a change for a new attribute.
    pub fn created(path: impl Into<String>, after: AttrValue) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Create,
            before: None,
            after: Some(after),
        }
    }

    /// Create a change for a modified attribute.
    pub fn updated(path: impl Into<String>, before: AttrValue, after: AttrValue) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    /// Create a change for a removed attribute.
    pub fn deleted(path: impl Into<String>, before: AttrValue) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Delete,
            before: Some(before),
            after: None,
        }
    }
}

impl From<crate::generated::AttributeChange> for AttributeChange {
    fn from(proto: crate::generated::AttributeChange) -> Self {
        let decode = |bytes: &[u8]| {
            if bytes.is_empty() {
                None
            } else {
                serde_json::from_slice(bytes).ok().map(AttrValue::from_wire)
            }
        };
        Self {
            path: proto.path.clone(),
            action: match crate::generated::attribute_change::Action::try_from(proto.action) {
                Ok(crate::generated::attribute_change::Action::Create) => ChangeAction::Create,
                Ok(crate::generated::attribute_change::Action::Update) => ChangeAction::Update,
                Ok(crate::generated::attribute_change::Action::Delete) => ChangeAction::Delete,
                _ => ChangeAction::NoOp,
            },
            before: decode(&proto.before),
            after: decode(&proto.after),
        }
    }
}

impl From<AttributeChange> for crate::generated::AttributeChange {
    fn from(change: AttributeChange) -> Self {
        let encode = |value: Option<AttrValue>| {
            value
                .map(|v| serde_json::to_vec(&v.to_wire()).unwrap_or_default())
                .unwrap_or_default()
        };
        Self {
            path: change.path,
            action: match change.action {
                ChangeAction::Create => crate::generated::attribute_change::Action::Create as i32,
                ChangeAction::Update => crate::generated::attribute_change::Action::Update as i32,
                ChangeAction::Delete => crate::generated::attribute_change::Action::Delete as i32,
                ChangeAction::NoOp => crate::generated::attribute_change::Action::Noop as i32,
            },
            before: encode(change.before),
            after: encode(change.after),
        }
    }
}

/// The result of planning a resource change: the diff between a prior state
/// and the provider-proposed state, plus the planned state itself.
///
/// A plan is only valid against the exact prior state it was computed from;
/// applying it against anything else is a stale-plan protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The resource type this plan was computed for.
    pub resource_type: String,
    /// The prior state the diff was computed against (`None` on create).
    pub prior: Option<TypedState>,
    /// The state that apply should produce (may contain unknown values).
    pub planned: TypedState,
    /// The attribute-level diff. Empty means no drift.
    pub changes: Vec<AttributeChange>,
}

impl Plan {
    /// Whether the plan has no changes (no drift).
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The change for a given attribute path, if any.
    pub fn change(&self, path: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.path == path)
    }
}

/// An imported resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The freshly read state.
    pub state: serde_json::Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata returned by GetMetadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// List of resource type names.
    pub resources: Vec<String>,
    /// List of data source type names.
    pub data_sources: Vec<String>,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
}

/// Server capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Whether the provider supports planning destroy operations.
    pub plan_destroy: bool,
}

/// Cooperative cancellation signal shared between the protocol server and
/// in-flight lifecycle operations.
///
/// Stopping is advisory: operations observe the signal at well-defined
/// checkpoints (their entry point), never mid-way through an effectful
/// apply step. An apply past its point of external effect runs to
/// completion.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Create a fresh, un-triggered signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trigger the signal. Idempotent.
    pub fn stop(&self) {
        // Receivers may all be gone during shutdown; that's fine.
        let _ = self.tx.send(true);
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until stop is requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // Only fails if the sender is dropped, which we hold.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The protocol version for the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake prefix output by providers.
pub const HANDSHAKE_PREFIX: &str = "HEMMER_PLUGIN";
