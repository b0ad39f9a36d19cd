//! Store abstraction, connection handles, and the connection error taxonomy.

use crate::migrations::record::MigrationRecord;
use anyhow::{Error as AnyError, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A backing store reachable through a connection.
///
/// Besides liveness and teardown, stores expose the two capabilities bootstrap needs:
/// executing migration statements and persisting migration records per namespace.
pub trait Store: Send + Sync {
    /// Short backend label used in logs (`memory`, `sqlite`, ...).
    fn backend(&self) -> &'static str;

    /// Lightweight round trip proving the store is reachable.
    fn ping(&self) -> BoxFuture<'_, Result<()>>;

    /// Executes one migration statement against the store.
    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, Result<()>>;

    fn has_migration<'a>(&'a self, namespace: &'a str, id: &'a str)
        -> BoxFuture<'a, Result<bool>>;

    /// Persists `record`. Recording an id twice in one namespace is an error.
    fn record_migration<'a>(&'a self, record: &'a MigrationRecord) -> BoxFuture<'a, Result<()>>;

    /// Records of `namespace`, ordered by id.
    fn migration_records<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Vec<MigrationRecord>>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Failed,
}

/// Connection-level failures surfaced by the registry.
#[derive(Debug)]
pub enum StoreError {
    UnsupportedScheme {
        store: String,
        uri: String,
    },
    Unreachable {
        store: String,
        uri: String,
        source: AnyError,
    },
    Timeout {
        store: String,
        uri: String,
        timeout: Duration,
    },
    Duplicate {
        store: String,
    },
    Unknown {
        store: String,
    },
    Disconnected {
        store: String,
    },
}

impl StoreError {
    pub fn store(&self) -> &str {
        match self {
            StoreError::UnsupportedScheme { store, .. }
            | StoreError::Unreachable { store, .. }
            | StoreError::Timeout { store, .. }
            | StoreError::Duplicate { store }
            | StoreError::Unknown { store }
            | StoreError::Disconnected { store } => store,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnsupportedScheme { store, uri } => {
                write!(f, "store {store}: no connector for uri {uri}")
            }
            StoreError::Unreachable { store, uri, source } => {
                write!(f, "store {store} at {uri} is unreachable: {source}")
            }
            StoreError::Timeout {
                store,
                uri,
                timeout,
            } => write!(
                f,
                "store {store} at {uri} did not connect within {timeout:?}"
            ),
            StoreError::Duplicate { store } => write!(f, "store {store} is already open"),
            StoreError::Unknown { store } => write!(f, "store {store} is not registered"),
            StoreError::Disconnected { store } => write!(f, "store {store} lost its connection"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Unreachable { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Live handle to one named store, owned by the registry.
pub struct Connection {
    name: String,
    uri: String,
    store: Arc<dyn Store>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .field("backend", &self.store.backend())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(name: String, uri: String, store: Arc<dyn Store>) -> Self {
        Self {
            name,
            uri,
            store,
            state: Mutex::new(ConnectionState::Connected),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Failed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Moves a connected handle to `Disconnected`. Returns `true` only for the call
    /// that performed the transition.
    pub(crate) fn mark_disconnected(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state != ConnectionState::Connected {
            return false;
        }
        *state = ConnectionState::Disconnected;
        true
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Closes the underlying store exactly once. Returns `Ok(false)` when the
    /// connection had already been closed.
    pub(crate) async fn close(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        match self.store.close().await {
            Ok(()) => {
                self.set_state(ConnectionState::Disconnected);
                Ok(true)
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn connection() -> (Connection, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let connection = Connection::new("data".into(), "memory://data".into(), store.clone());
        (connection, store)
    }

    #[tokio::test]
    async fn close_happens_once() {
        let (connection, store) = connection();
        assert!(connection.close().await.expect("first close"));
        assert!(!connection.close().await.expect("second close"));
        assert_eq!(store.close_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.is_closed());
    }

    #[test]
    fn disconnect_transition_reported_once() {
        let (connection, _) = connection();
        assert!(connection.mark_disconnected());
        assert!(!connection.mark_disconnected());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn errors_name_the_store() {
        let err = StoreError::Timeout {
            store: "accounts".into(),
            uri: "sqlite://accounts.db".into(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.store(), "accounts");
        assert!(err.to_string().contains("did not connect within 3s"));
    }
}
