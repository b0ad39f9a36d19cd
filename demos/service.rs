use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use middleware_bootstrap::store::ConnectionRegistry;
use middleware_bootstrap::{Bootstrap, ModelBindings, RequestLayer, ServiceConfig};
use tokio_util::sync::CancellationToken;

const DEFAULT_LOG_DIRECTIVE: &str = "info";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let config = ServiceConfig::from_env()?;
    let running = match Bootstrap::new(config)
        .start(&LoggingModels, &HeartbeatLayer)
        .await
    {
        Ok(running) => running,
        Err(err) => {
            tracing::error!(stage = %err.stage, error = %format!("{:#}", err.source), "service failed to start");
            std::process::exit(1);
        }
    };

    if let Some(report) = running.migration_report() {
        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migrations synced"
        );
    }

    let reason = running.run_until_shutdown().await;
    tracing::info!(reason = %reason, "service stopped");
    std::process::exit(reason.exit_code());
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    middleware_bootstrap::init_tracing();
}

/// Pings every store once; real services bind their models here.
struct LoggingModels;

impl ModelBindings for LoggingModels {
    fn init<'a>(&'a self, registry: &'a ConnectionRegistry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for name in registry.names() {
                let connection = registry.require(&name)?;
                connection.store().ping().await?;
                tracing::info!(store = %name, backend = connection.store().backend(), "models bound");
            }
            Ok(())
        })
    }
}

/// Logs a heartbeat until shutdown instead of serving requests.
struct HeartbeatLayer;

impl RequestLayer for HeartbeatLayer {
    fn start<'a>(
        &'a self,
        _config: &'a ServiceConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            tracing::info!(stores = registry.names().len(), "service alive");
                        }
                    }
                }
            });
            tracing::info!("request layer started");
            Ok(())
        })
    }
}
