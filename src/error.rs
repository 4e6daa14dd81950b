//! Error types for the plugin protocol core.
//!
//! The taxonomy distinguishes session-fatal faults (no further operations on
//! this provider), instance-fatal faults (this resource is stuck, others
//! continue), retryable faults, and recoverable validation/plan problems.

use thiserror::Error;

/// Errors produced by the protocol core and by provider implementations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The provider could not produce its schema catalogue. Session-fatal:
    /// no further operations may proceed against this provider.
    #[error("Provider schema unavailable: {0}")]
    SchemaUnavailable(String),

    /// Stored state was written under a schema version newer than the
    /// connected provider supports. Never silently downgrade.
    #[error(
        "Unsupported schema version for '{resource_type}': state has version {stored}, provider supports up to {current}"
    )]
    UnsupportedSchemaVersion {
        /// The resource type the state belongs to.
        resource_type: String,
        /// The version tag on the stored state.
        stored: u64,
        /// The provider's current schema version for this type.
        current: u64,
    },

    /// A version-to-version state transformation failed or was missing.
    /// Fatal for the instance, not for the session.
    #[error("State upgrade failed for '{resource_type}' ({from} -> {to}): {message}")]
    StateUpgradeFailed {
        /// The resource type being upgraded.
        resource_type: String,
        /// The version the failing step started from.
        from: u64,
        /// The version the failing step was producing.
        to: u64,
        /// What went wrong.
        message: String,
    },

    /// The provider produced a proposed state that violates the schema,
    /// e.g. by dropping a required attribute. The caller may re-plan with
    /// corrected configuration.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// A plan was applied against a different prior state than the one it
    /// was computed from. Nothing is applied.
    #[error("Stale plan: {0}")]
    StalePlan(String),

    /// An apply made some changes and then failed. The best-known new state
    /// accompanies the error diagnostics and must be persisted.
    #[error("Apply partially failed: {0}")]
    PartialApply(String),

    /// Another operation is in flight for the same resource instance.
    /// Retryable with backoff, never fatal.
    #[error("Resource instance busy: {0}")]
    TransientBusy(String),

    /// Configuration did not validate. Surfaced to the config author; no
    /// state change.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A resource-level operation was attempted before `Configure`.
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// `Configure` was called more than once in a session.
    #[error("Provider already configured")]
    AlreadyConfigured,

    /// The requested resource type is not in the schema catalogue.
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    /// The requested data source type is not in the schema catalogue.
    #[error("Unknown data source type: {0}")]
    UnknownDataSource(String),

    /// The provider session is shutting down; new lifecycle operations are
    /// refused at their entry checkpoint.
    #[error("Provider is stopping")]
    Stopping,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// An opaque failure inside provider-specific logic.
    #[error("Provider error: {0}")]
    Provider(String),
}

impl ProtocolError {
    /// Whether this fault terminates the whole provider session.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Self::SchemaUnavailable(_))
    }

    /// Whether this fault aborts the current resource instance's lifecycle
    /// while leaving the rest of the session usable.
    pub fn is_fatal_for_instance(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSchemaVersion { .. } | Self::StateUpgradeFailed { .. }
        )
    }

    /// Whether the caller should retry with backoff rather than report.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientBusy(_))
    }
}

impl From<ProtocolError> for tonic::Status {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::SchemaUnavailable(msg) => tonic::Status::internal(msg),
            err @ ProtocolError::UnsupportedSchemaVersion { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            },
            err @ ProtocolError::StateUpgradeFailed { .. } => {
                tonic::Status::internal(err.to_string())
            },
            ProtocolError::InvalidPlan(msg) => tonic::Status::invalid_argument(msg),
            ProtocolError::StalePlan(msg) => tonic::Status::aborted(msg),
            ProtocolError::PartialApply(msg) => tonic::Status::internal(msg),
            ProtocolError::TransientBusy(msg) => tonic::Status::unavailable(msg),
            ProtocolError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProtocolError::NotConfigured(msg) => tonic::Status::failed_precondition(msg),
            ProtocolError::AlreadyConfigured => {
                tonic::Status::failed_precondition("provider already configured")
            },
            ProtocolError::UnknownResourceType(msg) => tonic::Status::not_found(msg),
            ProtocolError::UnknownDataSource(msg) => tonic::Status::not_found(msg),
            ProtocolError::Stopping => tonic::Status::cancelled("provider is stopping"),
            ProtocolError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProtocolError::Transport(err) => {
                tonic::Status::unavailable(format!("Transport error: {}", err))
            },
            ProtocolError::Provider(msg) => tonic::Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnsupportedSchemaVersion {
            resource_type: "disk".to_string(),
            stored: 3,
            current: 2,
        };
        assert_eq!(
            format!("{}", err),
            "Unsupported schema version for 'disk': state has version 3, provider supports up to 2"
        );

        let err = ProtocolError::StateUpgradeFailed {
            resource_type: "disk".to_string(),
            from: 1,
            to: 2,
            message: "bad size".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "State upgrade failed for 'disk' (1 -> 2): bad size"
        );
    }

    #[test]
    fn test_severity_helpers() {
        assert!(ProtocolError::SchemaUnavailable("no schema".into()).is_fatal_for_session());
        assert!(!ProtocolError::SchemaUnavailable("no schema".into()).is_retryable());

        let upgrade = ProtocolError::StateUpgradeFailed {
            resource_type: "disk".into(),
            from: 0,
            to: 1,
            message: "boom".into(),
        };
        assert!(upgrade.is_fatal_for_instance());
        assert!(!upgrade.is_fatal_for_session());

        let busy = ProtocolError::TransientBusy("instance locked".into());
        assert!(busy.is_retryable());
        assert!(!busy.is_fatal_for_instance());

        assert!(!ProtocolError::InvalidPlan("oops".into()).is_fatal_for_instance());
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProtocolError::TransientBusy("busy".into()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = ProtocolError::StalePlan("prior changed".into()).into();
        assert_eq!(status.code(), tonic::Code::Aborted);

        let status: tonic::Status = ProtocolError::Validation("bad".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = ProtocolError::NotConfigured("call Configure first".into()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ProtocolError::UnknownResourceType("x".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
