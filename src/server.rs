//! Protocol server: the gRPC surface over the lifecycle machine.
//!
//! This module wires a [`ProviderService`] into the generated gRPC trait
//! through [`ResourceLifecycle`], and provides the `serve` functions that
//! start the server with the handshake protocol.
//!
//! Every reachable provider failure is reported as a response carrying
//! error diagnostics; the transport itself never crashes on them. The one
//! exception is a provider that cannot produce its schema at all, which
//! aborts `serve` before the listener binds.
//!
//! # Signal Handling
//!
//! The server automatically handles OS signals (SIGTERM, SIGINT) for graceful shutdown.
//! When a signal is received, the server:
//! 1. Stops accepting new connections
//! 2. Waits for in-flight requests to complete (with configurable timeout)
//! 3. Calls the provider's `stop()` method
//! 4. Exits cleanly

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::diagnostics::Diagnostics;
use crate::error::ProtocolError;
use crate::lifecycle::{InstanceKey, ResourceLifecycle};
use crate::provider::ProviderService;
use crate::state::RawState;
use crate::types::{HANDSHAKE_PREFIX, PROTOCOL_VERSION};

/// Wrapper that implements the generated gRPC trait over the lifecycle
/// machine.
struct ProviderGrpcService<P: ProviderService> {
    lifecycle: Arc<ResourceLifecycle<P>>,
}

impl<P: ProviderService> ProviderGrpcService<P> {
    fn diagnostics_to_proto(&self, diagnostics: Diagnostics) -> Vec<crate::generated::Diagnostic> {
        diagnostics
            .into_vec()
            .into_iter()
            .map(|d| crate::generated::Diagnostic {
                severity: match d.severity {
                    crate::diagnostics::Severity::Error => {
                        crate::generated::diagnostic::Severity::Error as i32
                    }
                    crate::diagnostics::Severity::Warning => {
                        crate::generated::diagnostic::Severity::Warning as i32
                    }
                },
                summary: d.summary,
                detail: d.detail.unwrap_or_default(),
                attribute: d.attribute.unwrap_or_default(),
            })
            .collect()
    }

    fn error_to_diagnostics(&self, err: ProtocolError) -> Vec<crate::generated::Diagnostic> {
        self.diagnostics_to_proto(Diagnostics::from(err))
    }

    fn schema_to_proto(&self, schema: &crate::schema::Schema) -> crate::generated::Schema {
        crate::generated::Schema {
            version: schema.version as i64,
            attributes: schema
                .attributes
                .iter()
                .map(|(name, attr)| crate::generated::Attribute {
                    name: name.clone(),
                    r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
                    required: attr.flags.required,
                    optional: attr.flags.optional,
                    computed: attr.flags.computed,
                    sensitive: attr.flags.sensitive,
                    description: attr.description.clone().unwrap_or_default(),
                    force_new: attr.force_new,
                    default_value: attr
                        .default
                        .as_ref()
                        .map(|v| serde_json::to_vec(v).unwrap_or_default())
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Wrap wire state bytes as a stored state at the resource's current
    /// schema version. States arriving on non-upgrade RPCs are expected to
    /// have gone through UpgradeResourceState already.
    fn wire_state(
        &self,
        resource_type: &str,
        bytes: &[u8],
    ) -> Result<Option<RawState>, ProtocolError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_slice(bytes)?;
        let version = self.lifecycle.registry().current_version(resource_type)?;
        Ok(Some(RawState::new(version, value)))
    }
}

#[tonic::async_trait]
impl<P: ProviderService> crate::generated::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: tonic::Request<crate::generated::GetMetadataRequest>,
    ) -> Result<tonic::Response<crate::generated::GetMetadataResponse>, tonic::Status> {
        debug!("GetMetadata called");
        match self.lifecycle.provider().metadata() {
            Ok(metadata) => {
                info!(
                    resources = metadata.resources.len(),
                    data_sources = metadata.data_sources.len(),
                    "GetMetadata completed"
                );
                Ok(tonic::Response::new(crate::generated::GetMetadataResponse {
                    server_capabilities: Some(crate::generated::ServerCapabilities {
                        plan_destroy: metadata.capabilities.plan_destroy,
                    }),
                    resources: metadata.resources,
                    data_sources: metadata.data_sources,
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "GetMetadata failed");
                Ok(tonic::Response::new(crate::generated::GetMetadataResponse {
                    server_capabilities: None,
                    resources: vec![],
                    data_sources: vec![],
                    diagnostics: self.error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<crate::generated::GetSchemaRequest>,
    ) -> Result<tonic::Response<crate::generated::GetSchemaResponse>, tonic::Status> {
        debug!("GetSchema called");
        let catalogue = self.lifecycle.registry().catalogue();
        info!(
            resources = catalogue.resources.len(),
            data_sources = catalogue.data_sources.len(),
            "GetSchema completed"
        );
        Ok(tonic::Response::new(crate::generated::GetSchemaResponse {
            provider: Some(self.schema_to_proto(&catalogue.provider)),
            resources: catalogue
                .resources
                .iter()
                .map(|(k, v)| (k.clone(), self.schema_to_proto(v)))
                .collect(),
            data_sources: catalogue
                .data_sources
                .iter()
                .map(|(k, v)| (k.clone(), self.schema_to_proto(v)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, request), name = "grpc.prepare_provider_config")]
    async fn prepare_provider_config(
        &self,
        request: tonic::Request<crate::generated::PrepareProviderConfigRequest>,
    ) -> Result<tonic::Response<crate::generated::PrepareProviderConfigResponse>, tonic::Status>
    {
        debug!("PrepareProviderConfig called");
        let req = request.into_inner();
        let config = serde_json::from_slice(&req.config).unwrap_or(serde_json::Value::Null);

        match self.lifecycle.prepare_config(config).await {
            Ok((prepared, diagnostics)) => {
                if diagnostics.has_errors() {
                    warn!(
                        diagnostics = diagnostics.len(),
                        "PrepareProviderConfig completed with errors"
                    );
                } else {
                    info!("PrepareProviderConfig completed successfully");
                }
                Ok(tonic::Response::new(
                    crate::generated::PrepareProviderConfigResponse {
                        prepared_config: serde_json::to_vec(&prepared).unwrap_or_default(),
                        diagnostics: self.diagnostics_to_proto(diagnostics),
                    },
                ))
            }
            Err(e) => {
                error!(error = %e, "PrepareProviderConfig failed");
                Ok(tonic::Response::new(
                    crate::generated::PrepareProviderConfigResponse {
                        prepared_config: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<crate::generated::ConfigureRequest>,
    ) -> Result<tonic::Response<crate::generated::ConfigureResponse>, tonic::Status> {
        debug!("Configure called");
        let req = request.into_inner();
        let config = serde_json::from_slice(&req.config).unwrap_or(serde_json::Value::Null);

        match self.lifecycle.configure(config).await {
            Ok(diagnostics) => {
                if diagnostics.has_errors() {
                    warn!(
                        diagnostics = diagnostics.len(),
                        "Configure completed with errors"
                    );
                } else {
                    info!("Configure completed successfully");
                }
                Ok(tonic::Response::new(crate::generated::ConfigureResponse {
                    diagnostics: self.diagnostics_to_proto(diagnostics),
                }))
            }
            Err(e) => {
                error!(error = %e, "Configure failed");
                Ok(tonic::Response::new(crate::generated::ConfigureResponse {
                    diagnostics: self.error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<crate::generated::StopRequest>,
    ) -> Result<tonic::Response<crate::generated::StopResponse>, tonic::Status> {
        info!("Stop called");
        match self.lifecycle.stop().await {
            Ok(()) => {
                info!("Stop completed successfully");
                Ok(tonic::Response::new(crate::generated::StopResponse {
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(error = %e, "Stop failed");
                Ok(tonic::Response::new(crate::generated::StopResponse {
                    diagnostics: self.error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.validate_resource_type_config")]
    async fn validate_resource_type_config(
        &self,
        request: tonic::Request<crate::generated::ValidateResourceTypeConfigRequest>,
    ) -> Result<tonic::Response<crate::generated::ValidateResourceTypeConfigResponse>, tonic::Status>
    {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, "ValidateResourceTypeConfig called");
        let config = serde_json::from_slice(&req.config).unwrap_or(serde_json::Value::Null);

        match self
            .lifecycle
            .validate_resource_config(&req.resource_type, config)
            .await
        {
            Ok(diagnostics) => {
                if diagnostics.has_errors() {
                    warn!(resource_type = %req.resource_type, diagnostics = diagnostics.len(), "ValidateResourceTypeConfig completed with errors");
                } else {
                    info!(resource_type = %req.resource_type, "ValidateResourceTypeConfig completed successfully");
                }
                Ok(tonic::Response::new(
                    crate::generated::ValidateResourceTypeConfigResponse {
                        diagnostics: self.diagnostics_to_proto(diagnostics),
                    },
                ))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "ValidateResourceTypeConfig failed");
                Ok(tonic::Response::new(
                    crate::generated::ValidateResourceTypeConfigResponse {
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        request: tonic::Request<crate::generated::UpgradeResourceStateRequest>,
    ) -> Result<tonic::Response<crate::generated::UpgradeResourceStateResponse>, tonic::Status>
    {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, version = req.version, "UpgradeResourceState called");
        if req.version < 0 {
            warn!(resource_type = %req.resource_type, version = req.version, "UpgradeResourceState rejected negative version");
            return Ok(tonic::Response::new(
                crate::generated::UpgradeResourceStateResponse {
                    upgraded_state: vec![],
                    diagnostics: self.error_to_diagnostics(ProtocolError::Validation(format!(
                        "schema version {} is not a valid stored version",
                        req.version
                    ))),
                },
            ));
        }
        let state = serde_json::from_slice(&req.raw_state).unwrap_or(serde_json::Value::Null);
        let raw = RawState::new(req.version as u64, state);

        match self.lifecycle.upgrade_state(&req.resource_type, raw) {
            Ok(upgraded) => {
                info!(resource_type = %req.resource_type, from_version = req.version, "UpgradeResourceState completed");
                Ok(tonic::Response::new(
                    crate::generated::UpgradeResourceStateResponse {
                        upgraded_state: serde_json::to_vec(&upgraded.to_value())
                            .unwrap_or_default(),
                        diagnostics: vec![],
                    },
                ))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, version = req.version, error = %e, "UpgradeResourceState failed");
                Ok(tonic::Response::new(
                    crate::generated::UpgradeResourceStateResponse {
                        upgraded_state: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.read_resource")]
    async fn read_resource(
        &self,
        request: tonic::Request<crate::generated::ReadResourceRequest>,
    ) -> Result<tonic::Response<crate::generated::ReadResourceResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, "ReadResource called");

        let current = match self.wire_state(&req.resource_type, &req.current_state) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(resource_type = %req.resource_type, "ReadResource called without state");
                let e = ProtocolError::Validation(
                    "ReadResource requires a current state".to_string(),
                );
                return Ok(tonic::Response::new(
                    crate::generated::ReadResourceResponse {
                        new_state: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ));
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "ReadResource failed");
                return Ok(tonic::Response::new(
                    crate::generated::ReadResourceResponse {
                        new_state: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ));
            }
        };

        match self.lifecycle.read(&req.resource_type, current).await {
            Ok(Some(state)) => {
                info!(resource_type = %req.resource_type, "ReadResource completed");
                Ok(tonic::Response::new(crate::generated::ReadResourceResponse {
                    new_state: serde_json::to_vec(&state.to_value()).unwrap_or_default(),
                    diagnostics: vec![],
                }))
            }
            Ok(None) => {
                // The resource vanished out from under us. Empty state, no
                // error diagnostics.
                info!(resource_type = %req.resource_type, "ReadResource found resource gone");
                Ok(tonic::Response::new(crate::generated::ReadResourceResponse {
                    new_state: vec![],
                    diagnostics: vec![],
                }))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "ReadResource failed");
                Ok(tonic::Response::new(crate::generated::ReadResourceResponse {
                    new_state: vec![],
                    diagnostics: self.error_to_diagnostics(e),
                }))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.plan_resource_change")]
    async fn plan_resource_change(
        &self,
        request: tonic::Request<crate::generated::PlanResourceChangeRequest>,
    ) -> Result<tonic::Response<crate::generated::PlanResourceChangeResponse>, tonic::Status> {
        let req = request.into_inner();
        let is_create = req.prior_state.is_empty();
        debug!(resource_type = %req.resource_type, instance = %req.instance_key, is_create, "PlanResourceChange called");

        let key = InstanceKey::new(&req.resource_type, &req.instance_key);
        let prior = match self.wire_state(&req.resource_type, &req.prior_state) {
            Ok(prior) => prior,
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "PlanResourceChange failed");
                return Ok(tonic::Response::new(
                    crate::generated::PlanResourceChangeResponse {
                        planned_state: vec![],
                        changes: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ));
            }
        };
        let config =
            serde_json::from_slice(&req.proposed_config).unwrap_or(serde_json::Value::Null);

        match self.lifecycle.plan(&key, prior, config).await {
            Ok(plan) => {
                info!(
                    resource_type = %req.resource_type,
                    changes = plan.changes.len(),
                    "PlanResourceChange completed"
                );
                Ok(tonic::Response::new(
                    crate::generated::PlanResourceChangeResponse {
                        planned_state: serde_json::to_vec(&plan.planned.to_value())
                            .unwrap_or_default(),
                        changes: plan.changes.into_iter().map(Into::into).collect(),
                        diagnostics: vec![],
                    },
                ))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "PlanResourceChange failed");
                Ok(tonic::Response::new(
                    crate::generated::PlanResourceChangeResponse {
                        planned_state: vec![],
                        changes: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.apply_resource_change")]
    async fn apply_resource_change(
        &self,
        request: tonic::Request<crate::generated::ApplyResourceChangeRequest>,
    ) -> Result<tonic::Response<crate::generated::ApplyResourceChangeResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, instance = %req.instance_key, "ApplyResourceChange called");

        let key = InstanceKey::new(&req.resource_type, &req.instance_key);
        let prior = match self.wire_state(&req.resource_type, &req.prior_state) {
            Ok(prior) => prior,
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "ApplyResourceChange failed");
                return Ok(tonic::Response::new(
                    crate::generated::ApplyResourceChangeResponse {
                        new_state: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ));
            }
        };
        let planned =
            serde_json::from_slice(&req.planned_state).unwrap_or(serde_json::Value::Null);

        match self.lifecycle.apply(&key, prior, planned).await {
            Ok(outcome) => {
                if outcome.diagnostics.has_errors() {
                    warn!(resource_type = %req.resource_type, "ApplyResourceChange completed with errors");
                } else {
                    info!(resource_type = %req.resource_type, "ApplyResourceChange completed");
                }
                Ok(tonic::Response::new(
                    crate::generated::ApplyResourceChangeResponse {
                        new_state: outcome
                            .new_state
                            .map(|s| serde_json::to_vec(&s.to_value()).unwrap_or_default())
                            .unwrap_or_default(),
                        diagnostics: self.diagnostics_to_proto(outcome.diagnostics),
                    },
                ))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "ApplyResourceChange failed");
                Ok(tonic::Response::new(
                    crate::generated::ApplyResourceChangeResponse {
                        new_state: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.import_resource_state")]
    async fn import_resource_state(
        &self,
        request: tonic::Request<crate::generated::ImportResourceStateRequest>,
    ) -> Result<tonic::Response<crate::generated::ImportResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, id = %req.id, "ImportResourceState called");

        let key = InstanceKey::new(&req.resource_type, &req.instance_key);
        match self.lifecycle.import(&key, &req.id).await {
            Ok(imported) => {
                info!(resource_type = %req.resource_type, count = imported.len(), "ImportResourceState completed");
                Ok(tonic::Response::new(
                    crate::generated::ImportResourceStateResponse {
                        imported: imported
                            .into_iter()
                            .map(|r| crate::generated::ImportedResource {
                                resource_type: r.resource_type,
                                state: serde_json::to_vec(&r.state).unwrap_or_default(),
                            })
                            .collect(),
                        diagnostics: vec![],
                    },
                ))
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, id = %req.id, error = %e, "ImportResourceState failed");
                Ok(tonic::Response::new(
                    crate::generated::ImportResourceStateResponse {
                        imported: vec![],
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.validate_data_source_config")]
    async fn validate_data_source_config(
        &self,
        request: tonic::Request<crate::generated::ValidateDataSourceConfigRequest>,
    ) -> Result<tonic::Response<crate::generated::ValidateDataSourceConfigResponse>, tonic::Status>
    {
        let req = request.into_inner();
        debug!(data_source_type = %req.data_source_type, "ValidateDataSourceConfig called");
        let config = serde_json::from_slice(&req.config).unwrap_or(serde_json::Value::Null);

        match self
            .lifecycle
            .validate_data_source_config(&req.data_source_type, config)
            .await
        {
            Ok(diagnostics) => {
                if diagnostics.has_errors() {
                    warn!(data_source_type = %req.data_source_type, diagnostics = diagnostics.len(), "ValidateDataSourceConfig completed with errors");
                } else {
                    info!(data_source_type = %req.data_source_type, "ValidateDataSourceConfig completed successfully");
                }
                Ok(tonic::Response::new(
                    crate::generated::ValidateDataSourceConfigResponse {
                        diagnostics: self.diagnostics_to_proto(diagnostics),
                    },
                ))
            }
            Err(e) => {
                error!(data_source_type = %req.data_source_type, error = %e, "ValidateDataSourceConfig failed");
                Ok(tonic::Response::new(
                    crate::generated::ValidateDataSourceConfigResponse {
                        diagnostics: self.error_to_diagnostics(e),
                    },
                ))
            }
        }
    }

    #[instrument(skip(self, request), name = "grpc.read_data_source")]
    async fn read_data_source(
        &self,
        request: tonic::Request<crate::generated::ReadDataSourceRequest>,
    ) -> Result<tonic::Response<crate::generated::ReadDataSourceResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(data_source_type = %req.data_source_type, "ReadDataSource called");
        let config = serde_json::from_slice(&req.config).unwrap_or(serde_json::Value::Null);

        match self
            .lifecycle
            .read_data_source(&req.data_source_type, config)
            .await
        {
            Ok((state, diagnostics)) => {
                info!(data_source_type = %req.data_source_type, "ReadDataSource completed");
                Ok(tonic::Response::new(crate::generated::ReadDataSourceResponse {
                    state: serde_json::to_vec(&state.to_value()).unwrap_or_default(),
                    diagnostics: self.diagnostics_to_proto(diagnostics),
                }))
            }
            Err(e) => {
                error!(data_source_type = %req.data_source_type, error = %e, "ReadDataSource failed");
                Ok(tonic::Response::new(crate::generated::ReadDataSourceResponse {
                    state: vec![],
                    diagnostics: self.error_to_diagnostics(e),
                }))
            }
        }
    }
}

/// Options for serving a provider.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Timeout for graceful shutdown. After receiving a shutdown signal,
    /// the server waits this long for in-flight requests before forcing
    /// shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// On Unix, waits for either SIGTERM or SIGINT. On other platforms, waits
/// for CTRL+C.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                eprintln!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                eprintln!("Received SIGINT, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        eprintln!("Received CTRL+C, initiating graceful shutdown...");
    }
}

/// Serve a provider, letting the OS pick the port.
///
/// This function:
/// 1. Builds the lifecycle machine, failing fast if the provider cannot
///    produce its schema
/// 2. Finds an available port
/// 3. Starts the gRPC server
/// 4. Outputs the handshake string to stdout
/// 5. Handles shutdown signals (SIGTERM/SIGINT) gracefully
///
/// The handshake format is: `HEMMER_PLUGIN|<version>|<address>`
///
/// For custom configuration, use [`serve_with_options`].
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a provider with custom options.
///
/// See [`serve`] for details. This function allows configuring
/// shutdown behavior via [`ServeOptions`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Build the lifecycle first so a broken schema aborts before we bind.
    let lifecycle = Arc::new(ResourceLifecycle::new(Arc::new(provider))?);

    // Find an available port by binding to port 0
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    serve_on_listener(lifecycle, listener, addr, options).await
}

/// Serve a provider on a specific address.
///
/// Unlike [`serve`], this function binds to the specified address rather than
/// finding an available port.
pub async fn serve_on<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    serve_on_with_options(provider, addr, ServeOptions::default()).await
}

/// Serve a provider on a specific address with custom options.
pub async fn serve_on_with_options<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let lifecycle = Arc::new(ResourceLifecycle::new(Arc::new(provider))?);
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    serve_on_listener(lifecycle, listener, actual_addr, options).await
}

/// Internal function to serve on an already-bound listener.
async fn serve_on_listener<P: ProviderService>(
    lifecycle: Arc<ResourceLifecycle<P>>,
    listener: TcpListener,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Output the handshake
    println!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr);

    info!(address = %addr, "Plugin server starting");

    let lifecycle_for_shutdown = Arc::clone(&lifecycle);

    // Create the gRPC service
    let grpc_service = ProviderGrpcService { lifecycle };
    let server = crate::generated::provider_server::ProviderServer::new(grpc_service);

    // Run the server with graceful shutdown
    // The shutdown_timeout limits how long we wait for in-flight requests to
    // complete once a signal has been received; it does not bound the normal
    // lifetime of the server.
    let (drain_tx, mut drain_rx) = tokio::sync::watch::channel(false);
    let server_future = Server::builder()
        .add_service(server)
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async move {
                wait_for_shutdown_signal().await;
                let _ = drain_tx.send(true);
            },
        );
    tokio::pin!(server_future);

    let drain_deadline = async {
        loop {
            if *drain_rx.borrow_and_update() {
                break;
            }
            if drain_rx.changed().await.is_err() {
                // Sender dropped without signalling; never fire.
                std::future::pending::<()>().await;
            }
        }
        tokio::time::sleep(options.shutdown_timeout).await;
    };

    tokio::select! {
        result = &mut server_future => {
            match result {
                Ok(()) => info!("Server shutdown complete"),
                Err(e) => {
                    error!(error = %e, "Server error during shutdown");
                    return Err(e.into());
                }
            }
        }
        _ = drain_deadline => {
            warn!(
                timeout = ?options.shutdown_timeout,
                "Shutdown timeout exceeded, forcing shutdown"
            );
        }
    }

    // Flip the stop signal and let the provider release what it holds
    debug!("Calling provider stop()");
    if let Err(e) = lifecycle_for_shutdown.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Plugin shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostic;
    use crate::generated::provider_server::Provider as GrpcProvider;
    use crate::provider::ApplyFailure;
    use crate::schema::{Attribute, ProviderSchema, Schema};
    use serde_json::{json, Value};

    struct EchoProvider;

    #[async_trait::async_trait]
    impl ProviderService for EchoProvider {
        fn schema(&self) -> Result<ProviderSchema, ProtocolError> {
            Ok(ProviderSchema::new()
                .with_resource(
                    "echo",
                    Schema::v0()
                        .with_attribute("message", Attribute::required_string())
                        .with_attribute("id", Attribute::computed_string()),
                )
                .with_data_source(
                    "echo_lookup",
                    Schema::v0()
                        .with_attribute("message", Attribute::required_string())
                        .with_attribute("id", Attribute::computed_string()),
                ))
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
            obj.insert("id".to_string(), json!("echo-1"));
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
            obj.insert("id".to_string(), json!("echo-1"));
            Ok(Value::Object(obj))
        }
    }

    fn service() -> ProviderGrpcService<EchoProvider> {
        ProviderGrpcService {
            lifecycle: Arc::new(ResourceLifecycle::new(Arc::new(EchoProvider)).unwrap()),
        }
    }

    async fn configured_service() -> ProviderGrpcService<EchoProvider> {
        let svc = service();
        let resp = svc
            .configure(tonic::Request::new(crate::generated::ConfigureRequest {
                config: serde_json::to_vec(&json!({})).unwrap(),
            }))
            .await
            .unwrap();
        assert!(resp.into_inner().diagnostics.is_empty());
        svc
    }

    #[tokio::test]
    async fn test_get_schema_lists_resources() {
        let svc = service();
        let resp = svc
            .get_schema(tonic::Request::new(crate::generated::GetSchemaRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.resources.contains_key("echo"));
        assert!(resp.data_sources.contains_key("echo_lookup"));
        assert!(resp.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_get_metadata() {
        let svc = service();
        let resp = svc
            .get_metadata(tonic::Request::new(crate::generated::GetMetadataRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.resources, vec!["echo".to_string()]);
        assert_eq!(resp.data_sources, vec!["echo_lookup".to_string()]);
    }

    #[tokio::test]
    async fn test_plan_before_configure_reports_diagnostics() {
        let svc = service();
        let resp = svc
            .plan_resource_change(tonic::Request::new(
                crate::generated::PlanResourceChangeRequest {
                    resource_type: "echo".to_string(),
                    instance_key: "a".to_string(),
                    prior_state: vec![],
                    proposed_config: serde_json::to_vec(&json!({"message": "hi"})).unwrap(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.diagnostics.is_empty());
        assert!(resp.diagnostics[0].summary.contains("Configure"));
    }

    #[tokio::test]
    async fn test_plan_and_apply_round_trip() {
        let svc = configured_service().await;
        let plan_resp = svc
            .plan_resource_change(tonic::Request::new(
                crate::generated::PlanResourceChangeRequest {
                    resource_type: "echo".to_string(),
                    instance_key: "a".to_string(),
                    prior_state: vec![],
                    proposed_config: serde_json::to_vec(&json!({"message": "hi"})).unwrap(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(plan_resp.diagnostics.is_empty());
        assert!(!plan_resp.changes.is_empty());

        let apply_resp = svc
            .apply_resource_change(tonic::Request::new(
                crate::generated::ApplyResourceChangeRequest {
                    resource_type: "echo".to_string(),
                    instance_key: "a".to_string(),
                    prior_state: vec![],
                    planned_state: plan_resp.planned_state,
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(apply_resp.diagnostics.is_empty());
        let state: Value = serde_json::from_slice(&apply_resp.new_state).unwrap();
        assert_eq!(state["id"], json!("echo-1"));
        assert_eq!(state["message"], json!("hi"));
    }

    #[tokio::test]
    async fn test_apply_without_plan_reports_stale() {
        let svc = configured_service().await;
        let resp = svc
            .apply_resource_change(tonic::Request::new(
                crate::generated::ApplyResourceChangeRequest {
                    resource_type: "echo".to_string(),
                    instance_key: "a".to_string(),
                    prior_state: vec![],
                    planned_state: serde_json::to_vec(&json!({"message": "hi", "id": "x"}))
                        .unwrap(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.diagnostics.is_empty());
        assert!(resp.new_state.is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_rejects_negative_version() {
        let svc = service();
        let resp = svc
            .upgrade_resource_state(tonic::Request::new(
                crate::generated::UpgradeResourceStateRequest {
                    resource_type: "echo".to_string(),
                    version: -1,
                    raw_state: serde_json::to_vec(&json!({"message": "hi"})).unwrap(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.upgraded_state.is_empty());
        assert!(!resp.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_validate_unknown_resource_type() {
        let svc = service();
        let resp = svc
            .validate_resource_type_config(tonic::Request::new(
                crate::generated::ValidateResourceTypeConfigRequest {
                    resource_type: "bogus".to_string(),
                    config: serde_json::to_vec(&json!({})).unwrap(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_read_data_source() {
        let svc = configured_service().await;
        let resp = svc
            .read_data_source(tonic::Request::new(crate::generated::ReadDataSourceRequest {
                data_source_type: "echo_lookup".to_string(),
                config: serde_json::to_vec(&json!({"message": "hi"})).unwrap(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty());
        let state: Value = serde_json::from_slice(&resp.state).unwrap();
        assert_eq!(state["id"], json!("echo-1"));
    }

    #[tokio::test]
    async fn test_stop_returns_clean() {
        let svc = configured_service().await;
        let resp = svc
            .stop(tonic::Request::new(crate::generated::StopRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty());
    }
}
