//! Named store connections with fail-fast disconnect reporting.
//!
//! The registry is built once at startup and shared by `Arc`; there is no global
//! connection state. Stores lost after startup are reported on a broadcast channel
//! consumed by the shutdown coordinator.

use crate::runtime::config::StoreSettings;
use crate::runtime::telemetry::Telemetry;
use crate::store::connection::{Connection, Store, StoreError};
use crate::store::memory::{MemoryConnector, MEMORY_SCHEME};
use crate::store::monitor::HealthMonitor;
use crate::store::sqlite::{SqliteConnector, SQLITE_SCHEME};
use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DISCONNECT_CHANNEL_CAPACITY: usize = 16;

/// Opens stores for one URI scheme.
pub trait StoreConnector: Send + Sync {
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Arc<dyn Store>>>;
}

/// Emitted once per connection when a previously healthy store stops answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub store: String,
    pub uri: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }
}

pub struct ConnectionRegistry {
    options: RegistryOptions,
    connectors: RwLock<HashMap<String, Arc<dyn StoreConnector>>>,
    connections: RwLock<BTreeMap<String, Arc<Connection>>>,
    events: broadcast::Sender<DisconnectEvent>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    monitor_shutdown: CancellationToken,
    closing: Arc<AtomicBool>,
    telemetry: Arc<Telemetry>,
}

impl ConnectionRegistry {
    /// Creates a registry with the built-in `memory://` and `sqlite://` connectors.
    pub fn new(options: RegistryOptions, telemetry: Arc<Telemetry>) -> Self {
        let (events, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        let registry = Self {
            options,
            connectors: RwLock::new(HashMap::new()),
            connections: RwLock::new(BTreeMap::new()),
            events,
            monitors: Mutex::new(Vec::new()),
            monitor_shutdown: CancellationToken::new(),
            closing: Arc::new(AtomicBool::new(false)),
            telemetry,
        };
        registry.register_connector(MEMORY_SCHEME, Arc::new(MemoryConnector::new()));
        registry.register_connector(SQLITE_SCHEME, Arc::new(SqliteConnector));
        registry
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    /// Installs (or replaces) the connector used for `scheme` URIs.
    pub fn register_connector(&self, scheme: &str, connector: Arc<dyn StoreConnector>) {
        if let Ok(mut connectors) = self.connectors.write() {
            connectors.insert(scheme.to_ascii_lowercase(), connector);
        }
    }

    /// Subscribes to disconnect events. Subscribe before opening stores so no event is missed.
    pub fn disconnect_events(&self) -> broadcast::Receiver<DisconnectEvent> {
        self.events.subscribe()
    }

    /// Connects `name` to `uri` through the connector registered for the URI scheme.
    pub async fn open(&self, name: &str, uri: &str) -> Result<Arc<Connection>> {
        self.ensure_vacant(name)?;

        let connector = self.connector_for(name, uri)?;
        let store = match timeout(self.options.connect_timeout, connector.connect(uri)).await {
            Ok(Ok(store)) => store,
            Ok(Err(source)) => {
                return Err(StoreError::Unreachable {
                    store: name.to_owned(),
                    uri: uri.to_owned(),
                    source,
                }
                .into())
            }
            Err(_) => {
                return Err(StoreError::Timeout {
                    store: name.to_owned(),
                    uri: uri.to_owned(),
                    timeout: self.options.connect_timeout,
                }
                .into())
            }
        };

        self.attach(name, uri, store).await
    }

    /// Registers an already constructed store under `name` after a bounded ping.
    pub async fn attach(
        &self,
        name: &str,
        uri: &str,
        store: Arc<dyn Store>,
    ) -> Result<Arc<Connection>> {
        self.ensure_vacant(name)?;

        match timeout(self.options.connect_timeout, store.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = store.close().await;
                return Err(StoreError::Unreachable {
                    store: name.to_owned(),
                    uri: uri.to_owned(),
                    source,
                }
                .into());
            }
            Err(_) => {
                let _ = store.close().await;
                return Err(StoreError::Timeout {
                    store: name.to_owned(),
                    uri: uri.to_owned(),
                    timeout: self.options.connect_timeout,
                }
                .into());
            }
        }

        let connection = Arc::new(Connection::new(name.to_owned(), uri.to_owned(), store));
        let inserted = match self.connections.write() {
            Ok(mut connections) if !connections.contains_key(name) => {
                connections.insert(name.to_owned(), connection.clone());
                true
            }
            _ => false,
        };
        if !inserted {
            let _ = connection.close().await;
            return Err(StoreError::Duplicate {
                store: name.to_owned(),
            }
            .into());
        }

        let monitor = HealthMonitor {
            connection: connection.clone(),
            check_interval: self.options.health_check_interval,
            ping_timeout: self.options.connect_timeout,
            shutdown: self.monitor_shutdown.child_token(),
            closing: self.closing.clone(),
            events: self.events.clone(),
        }
        .spawn();
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.push(monitor);
        }

        self.telemetry.record_store_opened();
        tracing::info!(
            store = name,
            backend = connection.store().backend(),
            "store connection established"
        );
        Ok(connection)
    }

    /// Opens every store concurrently. All attempts run to completion; the first error
    /// (in settings order) is returned.
    pub async fn open_all(&self, stores: &[StoreSettings]) -> Result<Vec<Arc<Connection>>> {
        let results = join_all(
            stores
                .iter()
                .map(|settings| self.open(&settings.name, &settings.uri)),
        )
        .await;

        results.into_iter().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .ok()
            .and_then(|connections| connections.get(name).cloned())
    }

    pub fn require(&self, name: &str) -> Result<Arc<Connection>> {
        self.get(name).ok_or_else(|| {
            StoreError::Unknown {
                store: name.to_owned(),
            }
            .into()
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.connections
            .read()
            .map(|connections| connections.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops the health monitors and closes every open connection exactly once.
    ///
    /// Safe to call on every exit path; returns how many connections this call closed.
    pub async fn close_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        self.monitor_shutdown.cancel();

        let monitors = self
            .monitors
            .lock()
            .map(|mut monitors| std::mem::take(&mut *monitors))
            .unwrap_or_default();
        for handle in monitors {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "store health monitor panicked");
            }
        }

        let connections: Vec<Arc<Connection>> = self
            .connections
            .read()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default();

        let mut closed = 0;
        for connection in connections {
            match connection.close().await {
                Ok(true) => {
                    closed += 1;
                    tracing::info!(store = connection.name(), "store connection closed");
                }
                Ok(false) => {}
                Err(err) => {
                    closed += 1;
                    tracing::warn!(
                        store = connection.name(),
                        error = %err,
                        "store connection closed with error"
                    );
                }
            }
        }
        closed
    }

    fn ensure_vacant(&self, name: &str) -> Result<()> {
        let connections = self
            .connections
            .read()
            .map_err(|_| anyhow::anyhow!("connection registry poisoned"))?;
        if connections.contains_key(name) {
            return Err(StoreError::Duplicate {
                store: name.to_owned(),
            }
            .into());
        }
        Ok(())
    }

    fn connector_for(&self, name: &str, uri: &str) -> Result<Arc<dyn StoreConnector>> {
        let scheme = uri
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        let connectors = self
            .connectors
            .read()
            .map_err(|_| anyhow::anyhow!("connector table poisoned"))?;
        connectors
            .get(&scheme)
            .cloned()
            .ok_or_else(|| {
                StoreError::UnsupportedScheme {
                    store: name.to_owned(),
                    uri: uri.to_owned(),
                }
                .into()
            })
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.monitor_shutdown.cancel();
    }
}
