//! Hemmer Plugin Core
//!
//! This crate implements the plugin protocol an orchestration engine uses to
//! drive out-of-process provider plugins over gRPC. It follows the pattern
//! established by
//! [terraform-plugin-go](https://github.com/hashicorp/terraform-plugin-go).
//!
//! # Overview
//!
//! The crate provides:
//!
//! - **Protocol Buffers types**: Pre-compiled Rust types from the canonical plugin protocol
//! - **Schema registry**: Versioned schemas for provider config, resources, and data sources
//! - **State upgrade engine**: Chained per-version migrations for stored state
//! - **Lifecycle state machine**: Configure/plan/apply ordering, stale-plan
//!   detection, per-instance serialization
//! - **ProviderService trait**: The seam a concrete provider implements
//! - **Server helpers**: Functions to start a gRPC server with the handshake protocol
//! - **Diagnostics**: Ordered error/warning aggregation across operation phases
//! - **Logging**: Integration with `tracing` for structured logging
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_plugin_core::{
//!     serve, ProviderService, ProtocolError, ApplyFailure, Diagnostic,
//!     schema::{ProviderSchema, Schema, Attribute},
//! };
//!
//! struct MyProvider;
//!
//! #[async_trait::async_trait]
//! impl ProviderService for MyProvider {
//!     fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
//!         Ok(ProviderSchema::new()
//!             .with_resource("example_resource", Schema::v0()
//!                 .with_attribute("name", Attribute::required_string())
//!                 .with_attribute("id", Attribute::computed_string())))
//!     }
//!
//!     async fn configure(
//!         &self,
//!         config: serde_json::Value,
//!     ) -> Result<Vec<Diagnostic>, ProtocolError> {
//!         Ok(vec![])
//!     }
//!
//!     async fn apply(
//!         &self,
//!         resource_type: &str,
//!         prior: Option<serde_json::Value>,
//!         planned: serde_json::Value,
//!     ) -> Result<serde_json::Value, ApplyFailure> {
//!         Ok(planned)
//!     }
//!
//!     async fn read(
//!         &self,
//!         resource_type: &str,
//!         current_state: serde_json::Value,
//!     ) -> Result<Option<serde_json::Value>, ProtocolError> {
//!         Ok(Some(current_state))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     serve(MyProvider).await
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! When a plugin starts via [`serve`], it outputs a handshake string to stdout:
//!
//! ```text
//! HEMMER_PLUGIN|1|127.0.0.1:50051
//! ```
//!
//! Format: `HEMMER_PLUGIN|<protocol_version>|<address>`
//!
//! This allows the engine to spawn the plugin as a subprocess and connect via gRPC.
//!
//! # Plugin Protocol
//!
//! The wire surface (`hemmer.plugin.v1.Provider`):
//!
//! - **GetMetadata**: Returns provider capabilities and resource/data source names
//! - **GetSchema**: Returns full schema for provider config, resources, and data sources
//! - **PrepareProviderConfig**: Normalizes and pre-validates provider configuration
//! - **Configure**: Configures the provider with credentials (once per session)
//! - **Stop**: Gracefully shuts down the plugin
//! - **ValidateResourceTypeConfig**: Validates resource configuration
//! - **UpgradeResourceState**: Migrates state written under older schema versions
//! - **ReadResource**: Refreshes a resource's state from the real system
//! - **PlanResourceChange**: Computes the attribute-level diff for a change
//! - **ApplyResourceChange**: Executes a previously computed plan
//! - **ImportResourceState**: Imports existing infrastructure
//! - **ValidateDataSourceConfig**: Validates data source configuration
//! - **ReadDataSource**: Reads data from external sources
//!
//! Every operation response carries diagnostics; provider failures never
//! crash the transport. Only a provider that cannot produce its schema at
//! all aborts the session.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod server;
pub mod state;
pub mod testing;
pub mod types;
pub mod upgrade;
pub mod validation;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use backend::{MemoryBackend, OutputValue, StateBackend, StateSnapshot};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::ProtocolError;
pub use lifecycle::{ApplyOutcome, InstanceKey, Phase, ResourceLifecycle};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::{ApplyFailure, ProviderService};
pub use registry::SchemaRegistry;
pub use schema::ProviderSchema;
pub use server::{serve, serve_on, serve_on_with_options, serve_with_options, ServeOptions};
pub use state::{AttrValue, RawState, TypedState};
pub use types::{
    AttributeChange, ChangeAction, ImportedResource, Plan, ProviderMetadata, ServerCapabilities,
    StopSignal, HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
pub use upgrade::{StateUpgraders, UpgradeEngine};
pub use validation::{is_valid, validate, validate_result};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
