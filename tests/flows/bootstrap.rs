use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crate::support::helpers::init_tracing;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use middleware_bootstrap::store::{ConnectionRegistry, MemoryConnector};
use middleware_bootstrap::{
    Bootstrap, BootstrapStage, ModelBindings, RequestLayer, ServiceConfig, ShutdownReason,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MANIFEST: &str = r#"{
    "units": [
        {"id": "003_seed", "statements": ["INSERT INTO accounts (address) VALUES ('0x01');"]},
        {"id": "001_init", "statements": ["CREATE TABLE accounts (address TEXT PRIMARY KEY);"]},
        {"id": "002_add_index", "statements": ["CREATE INDEX accounts_address ON accounts (address);"]}
    ]
}"#;

struct NoModels;

impl ModelBindings for NoModels {
    fn init<'a>(&'a self, _registry: &'a ConnectionRegistry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct CountingLayer {
    starts: AtomicUsize,
    fail: bool,
}

impl RequestLayer for CountingLayer {
    fn start<'a>(
        &'a self,
        _config: &'a ServiceConfig,
        _registry: Arc<ConnectionRegistry>,
        _shutdown: CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("port already in use");
            }
            Ok(())
        })
    }
}

fn sqlite_config(dir: &std::path::Path) -> ServiceConfig {
    let manifest = dir.join("migrations.json");
    std::fs::write(&manifest, MANIFEST).expect("write manifest");
    ServiceConfig::builder()
        .store("accounts", "memory://accounts")
        .store("data", format!("sqlite://{}", dir.join("data.db").display()))
        .auto_sync_migrations(true)
        .collection_prefix("exchange_")
        .migrations_manifest(manifest)
        .build()
        .expect("valid service config")
}

#[tokio::test]
async fn restart_applies_manifest_once() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = sqlite_config(dir.path());

    let layer = CountingLayer::default();
    let running = Bootstrap::new(config.clone())
        .start(&NoModels, &layer)
        .await?;
    let report = running.migration_report().cloned().expect("auto-sync ran");
    assert_eq!(report.namespace, "_exchange_migrations");
    assert_eq!(report.applied, vec!["001_init", "002_add_index", "003_seed"]);
    running.coordinator().trigger(ShutdownReason::Cancelled);
    running.run_until_shutdown().await;

    let running = Bootstrap::new(config).start(&NoModels, &layer).await?;
    let report = running.migration_report().cloned().expect("auto-sync ran");
    assert!(report.applied.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(layer.starts.load(Ordering::SeqCst), 2);
    running.coordinator().trigger(ShutdownReason::Cancelled);
    running.run_until_shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failing_request_layer_closes_stores() -> Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let config = ServiceConfig::builder()
        .store("accounts", "memory://accounts")
        .store("data", "memory://data")
        .build()?;

    let layer = CountingLayer {
        fail: true,
        ..CountingLayer::default()
    };
    let err = match Bootstrap::new(config)
        .with_connector("memory", connector.clone())
        .start(&NoModels, &layer)
        .await
    {
        Ok(_) => bail!("bootstrap should have failed"),
        Err(err) => err,
    };

    assert_eq!(err.stage, BootstrapStage::RequestLayer);
    assert_eq!(connector.instance("accounts")?.close_count(), 1);
    assert_eq!(connector.instance("data")?.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn store_disconnect_ends_the_service_cleanly() -> Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let config = ServiceConfig::builder()
        .store("accounts", "memory://accounts")
        .store("data", "memory://data")
        .health_check_interval(Duration::from_millis(20))
        .build()?;

    let running = Bootstrap::new(config)
        .with_connector("memory", connector.clone())
        .start(&NoModels, &CountingLayer::default())
        .await?;

    connector.instance("data")?.simulate_disconnect();
    let reason = timeout(Duration::from_secs(5), running.run_until_shutdown()).await?;

    assert_eq!(
        reason,
        ShutdownReason::StoreDisconnected {
            store: "data".into()
        }
    );
    assert_eq!(reason.exit_code(), 0);
    assert_eq!(connector.instance("accounts")?.close_count(), 1);
    Ok(())
}
