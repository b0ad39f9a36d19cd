//! In-process store used for development setups and tests.
//!
//! `memory://<instance>` URIs resolve to a shared instance per name, so two registry
//! entries pointing at the same URI observe the same data.

use crate::migrations::record::{validate_namespace, MigrationRecord};
use crate::store::connection::Store;
use crate::store::registry::StoreConnector;
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MEMORY_SCHEME: &str = "memory";

#[derive(Debug, Default)]
struct MemoryInner {
    namespaces: BTreeMap<String, BTreeMap<String, MigrationRecord>>,
    executed: Vec<String>,
    failing_patterns: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    reachable: AtomicBool,
    closed: AtomicBool,
    pings: AtomicU64,
    closes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            reachable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            pings: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent ping fail, as if the server went away.
    pub fn simulate_disconnect(&self) {
        self.reachable.store(false, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    /// Statements containing `pattern` fail when executed.
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) -> Result<()> {
        self.lock()?.failing_patterns.push(pattern.into());
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<()> {
        self.lock()?.failing_patterns.clear();
        Ok(())
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock()
            .map(|inner| inner.executed.clone())
            .unwrap_or_default()
    }

    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store state poisoned"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("memory store is closed");
        }
        if !self.reachable.load(Ordering::SeqCst) {
            bail!("memory store is unreachable");
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        MEMORY_SCHEME
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::SeqCst);
            self.ensure_open()
        })
    }

    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut inner = self.lock()?;
            if let Some(pattern) = inner
                .failing_patterns
                .iter()
                .find(|pattern| statement.contains(pattern.as_str()))
            {
                bail!("statement rejected by store (matched {pattern:?})");
            }
            inner.executed.push(statement.to_owned());
            Ok(())
        })
    }

    fn has_migration<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.ensure_open()?;
            validate_namespace(namespace)?;
            let inner = self.lock()?;
            Ok(inner
                .namespaces
                .get(namespace)
                .map(|records| records.contains_key(id))
                .unwrap_or(false))
        })
    }

    fn record_migration<'a>(&'a self, record: &'a MigrationRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            validate_namespace(&record.namespace)?;
            let mut inner = self.lock()?;
            let records = inner
                .namespaces
                .entry(record.namespace.clone())
                .or_default();
            if records.contains_key(&record.id) {
                bail!(
                    "migration {} already recorded in {}",
                    record.id,
                    record.namespace
                );
            }
            records.insert(record.id.clone(), record.clone());
            Ok(())
        })
    }

    fn migration_records<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Vec<MigrationRecord>>> {
        Box::pin(async move {
            self.ensure_open()?;
            validate_namespace(namespace)?;
            let inner = self.lock()?;
            Ok(inner
                .namespaces
                .get(namespace)
                .map(|records| records.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Resolves `memory://<instance>` URIs to shared [`MemoryStore`] instances.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    instances: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance behind `memory://<instance>`, creating it on first use.
    pub fn instance(&self, instance: &str) -> Result<Arc<MemoryStore>> {
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| anyhow!("memory connector poisoned"))?;
        Ok(instances
            .entry(instance.to_owned())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone())
    }
}

impl StoreConnector for MemoryConnector {
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Arc<dyn Store>>> {
        Box::pin(async move {
            let instance = uri
                .strip_prefix("memory://")
                .ok_or_else(|| anyhow!("memory uri must start with memory://"))?;
            let store: Arc<dyn Store> = self.instance(instance.trim_end_matches('/'))?;
            Ok(store)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_scoped_by_namespace() {
        let store = MemoryStore::new();
        store
            .record_migration(&MigrationRecord::new("001_init", "a_migrations"))
            .await
            .unwrap();

        assert!(store.has_migration("a_migrations", "001_init").await.unwrap());
        assert!(!store.has_migration("b_migrations", "001_init").await.unwrap());
        assert!(store.migration_records("b_migrations").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_records_are_rejected() {
        let store = MemoryStore::new();
        let record = MigrationRecord::new("001_init", "_migrations");
        store.record_migration(&record).await.unwrap();
        let err = store.record_migration(&record).await.unwrap_err();
        assert!(format!("{err}").contains("already recorded"));
        assert_eq!(store.migration_records("_migrations").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn simulated_disconnect_fails_pings() {
        let store = MemoryStore::new();
        store.ping().await.unwrap();
        store.simulate_disconnect();
        assert!(store.ping().await.is_err());
        store.restore();
        store.ping().await.unwrap();
        assert_eq!(store.ping_count(), 3);
    }

    #[tokio::test]
    async fn failing_patterns_reject_statements() {
        let store = MemoryStore::new();
        store.fail_statements_containing("DROP").unwrap();
        store.execute("CREATE accounts").await.unwrap();
        assert!(store.execute("DROP accounts").await.is_err());
        assert_eq!(store.executed(), vec!["CREATE accounts".to_owned()]);
    }

    #[tokio::test]
    async fn connector_shares_instances_per_uri() {
        let connector = MemoryConnector::new();
        let first = connector.connect("memory://shared").await.unwrap();
        first
            .record_migration(&MigrationRecord::new("001_init", "_migrations"))
            .await
            .unwrap();
        let second = connector.connect("memory://shared").await.unwrap();
        assert!(second.has_migration("_migrations", "001_init").await.unwrap());

        let other = connector.connect("memory://other").await.unwrap();
        assert!(!other.has_migration("_migrations", "001_init").await.unwrap());
    }
}
