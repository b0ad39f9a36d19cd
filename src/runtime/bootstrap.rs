//! Composition root of the service: stores, model bindings, migrations, request layer.

use crate::migrations::manifest::MigrationManifest;
use crate::migrations::runner::{MigrationReport, MigrationRunner};
use crate::runtime::config::ServiceConfig;
use crate::runtime::fatal::{ShutdownCoordinator, ShutdownReason};
use crate::runtime::telemetry::Telemetry;
use crate::store::connection::StoreError;
use crate::store::registry::{ConnectionRegistry, StoreConnector};
use anyhow::{anyhow, Error as AnyError, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Binds domain models to the opened stores.
pub trait ModelBindings: Send + Sync {
    fn init<'a>(&'a self, registry: &'a ConnectionRegistry) -> BoxFuture<'a, Result<()>>;
}

/// Request-handling layer started once every store is bound and migrated.
///
/// `start` returns once the layer is accepting work; long-running tasks it spawns
/// should stop when `shutdown` is cancelled.
pub trait RequestLayer: Send + Sync {
    fn start<'a>(
        &'a self,
        config: &'a ServiceConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    Connect,
    Models,
    Migrations,
    RequestLayer,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BootstrapStage::Connect => "store connection",
            BootstrapStage::Models => "model binding",
            BootstrapStage::Migrations => "migration sync",
            BootstrapStage::RequestLayer => "request layer start",
        };
        f.write_str(label)
    }
}

/// Startup failure; the service never reached a listening state.
#[derive(Debug)]
pub struct BootstrapError {
    pub stage: BootstrapStage,
    pub source: AnyError,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bootstrap failed during {}: {}", self.stage, self.source)
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub struct Bootstrap {
    config: ServiceConfig,
    manifest: Option<MigrationManifest>,
    connectors: Vec<(String, Arc<dyn StoreConnector>)>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Bootstrap {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            manifest: None,
            connectors: Vec::new(),
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Uses `manifest` instead of loading the file named by the configuration.
    pub fn with_manifest(mut self, manifest: MigrationManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Adds or replaces the connector for `scheme` on the registry built at start.
    pub fn with_connector(mut self, scheme: &str, connector: Arc<dyn StoreConnector>) -> Self {
        self.connectors.push((scheme.to_owned(), connector));
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Root token of the service. Cancelling it ends `run_until_shutdown` with
    /// [`ShutdownReason::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the startup sequence in strict order. A failing step closes every store
    /// opened so far and the request layer is never started.
    pub async fn start(
        self,
        models: &dyn ModelBindings,
        request_layer: &dyn RequestLayer,
    ) -> Result<RunningService, BootstrapError> {
        let Bootstrap {
            config,
            manifest,
            connectors,
            telemetry,
            shutdown,
        } = self;

        let registry = Arc::new(ConnectionRegistry::new(
            config.registry_options(),
            telemetry.clone(),
        ));
        for (scheme, connector) in connectors {
            registry.register_connector(&scheme, connector);
        }

        let coordinator = ShutdownCoordinator::new(shutdown.clone(), telemetry.clone());
        let listener = coordinator.spawn_disconnect_listener(registry.disconnect_events());

        let sequence = async {
            registry
                .open_all(config.stores())
                .await
                .map_err(|source| (BootstrapStage::Connect, source))?;

            models
                .init(&registry)
                .await
                .map_err(|source| (BootstrapStage::Models, source))?;
            ensure_stores_held(&coordinator)?;

            let report = if config.auto_sync_migrations() {
                let report = sync_migrations(&config, manifest, &registry, &telemetry)
                    .await
                    .map_err(|source| (BootstrapStage::Migrations, source))?;
                Some(report)
            } else {
                tracing::info!("auto-sync disabled; migrations must be applied out of band");
                None
            };
            ensure_stores_held(&coordinator)?;

            request_layer
                .start(&config, registry.clone(), shutdown.child_token())
                .await
                .map_err(|source| (BootstrapStage::RequestLayer, source))?;

            Ok::<_, (BootstrapStage, AnyError)>(report)
        };

        match sequence.await {
            Ok(migrations) => {
                tracing::info!(stores = ?registry.names(), "service bootstrap complete");
                Ok(RunningService {
                    registry,
                    coordinator,
                    listener,
                    telemetry,
                    migrations,
                })
            }
            Err((stage, source)) => {
                tracing::error!(stage = %stage, error = %source, "service bootstrap failed");
                registry.close_all().await;
                shutdown.cancel();
                if let Err(err) = listener.await {
                    tracing::warn!(error = %err, "disconnect listener panicked");
                }
                Err(BootstrapError { stage, source })
            }
        }
    }
}

/// Fails the sequence if a shutdown was recorded while an earlier stage was running.
fn ensure_stores_held(
    coordinator: &ShutdownCoordinator,
) -> Result<(), (BootstrapStage, AnyError)> {
    match coordinator.reason() {
        None => Ok(()),
        Some(ShutdownReason::StoreDisconnected { store }) => Err((
            BootstrapStage::Connect,
            StoreError::Disconnected { store }.into(),
        )),
        Some(reason) => Err((
            BootstrapStage::Connect,
            anyhow!("shutdown requested during bootstrap: {reason}"),
        )),
    }
}

async fn sync_migrations(
    config: &ServiceConfig,
    manifest: Option<MigrationManifest>,
    registry: &ConnectionRegistry,
    telemetry: &Arc<Telemetry>,
) -> Result<MigrationReport> {
    let manifest = match (manifest, config.migrations_manifest()) {
        (Some(manifest), _) => manifest,
        (None, Some(path)) => MigrationManifest::load(path).await?,
        (None, None) => {
            return Err(anyhow!(
                "auto_sync_migrations is enabled but no migration manifest was provided"
            ))
        }
    };

    let connection = registry.require(config.migration_store())?;
    let store = connection.store();
    let report = MigrationRunner::new(store.as_ref(), config.tracking_namespace())
        .with_telemetry(telemetry.clone())
        .run(&manifest)
        .await?;
    Ok(report)
}

/// A started service waiting for its shutdown trigger.
pub struct RunningService {
    registry: Arc<ConnectionRegistry>,
    coordinator: ShutdownCoordinator,
    listener: JoinHandle<()>,
    telemetry: Arc<Telemetry>,
    migrations: Option<MigrationReport>,
}

impl RunningService {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Report of the startup migration sync, if auto-sync ran.
    pub fn migration_report(&self) -> Option<&MigrationReport> {
        self.migrations.as_ref()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    /// Waits for Ctrl-C, a lost store, or cancellation of the root token, then closes
    /// every store and returns why the service stopped.
    pub async fn run_until_shutdown(self) -> ShutdownReason {
        tracing::info!("service running; waiting for Ctrl-C (SIGINT) or a fatal condition");

        let reason = tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => {
                    self.coordinator.trigger(ShutdownReason::Signal);
                    self.coordinator.reason().unwrap_or(ShutdownReason::Signal)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unable to listen for Ctrl-C");
                    self.coordinator.triggered().await
                }
            },
            reason = self.coordinator.triggered() => reason,
        };

        self.shutdown(reason).await
    }

    async fn shutdown(self, reason: ShutdownReason) -> ShutdownReason {
        let closed = self.registry.close_all().await;
        self.coordinator.token().cancel();
        if let Err(err) = self.listener.await {
            tracing::warn!(error = %err, "disconnect listener panicked");
        }

        tracing::info!(reason = %reason, closed, "service stopped");
        self.telemetry.log_snapshot("shutdown");
        reason
    }
}
