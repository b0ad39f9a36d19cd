use crate::migrations::record::{tracking_namespace, validate_namespace};
use crate::store::registry::{
    RegistryOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEALTH_CHECK_INTERVAL,
};
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ACCOUNTS_STORE: &str = "accounts";
pub const DATA_STORE: &str = "data";
const DEFAULT_MIGRATION_STORE: &str = DATA_STORE;
const DEFAULT_ACCOUNTS_URI: &str = "memory://accounts";
const DEFAULT_DATA_URI: &str = "memory://data";

/// Name and URI of one backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub name: String,
    pub uri: String,
}

impl StoreSettings {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            uri: uri.into().trim().to_owned(),
        }
    }
}

/// Configuration consumed by the bootstrap sequencer.
///
/// Instances are constructed via [`ServiceConfig::builder`] or [`ServiceConfig::from_env`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    stores: Vec<StoreSettings>,
    auto_sync_migrations: bool,
    collection_prefix: String,
    migration_store: String,
    migrations_manifest: Option<PathBuf>,
    connect_timeout: Duration,
    health_check_interval: Duration,
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Reads the configuration from process environment variables.
    ///
    /// | variable | default |
    /// |---|---|
    /// | `ACCOUNTS_STORE_URI` | `memory://accounts` |
    /// | `DATA_STORE_URI` | `memory://data` |
    /// | `AUTO_SYNC_MIGRATIONS` | `false` |
    /// | `COLLECTION_PREFIX` | empty |
    /// | `MIGRATION_STORE` | `data` |
    /// | `MIGRATIONS_MANIFEST` | unset |
    /// | `STORE_CONNECT_TIMEOUT_SECS` | 10 |
    /// | `STORE_HEALTH_CHECK_INTERVAL_SECS` | 5 |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder()
            .store(
                ACCOUNTS_STORE,
                read_or_default(&lookup, "ACCOUNTS_STORE_URI", DEFAULT_ACCOUNTS_URI),
            )
            .store(
                DATA_STORE,
                read_or_default(&lookup, "DATA_STORE_URI", DEFAULT_DATA_URI),
            )
            .auto_sync_migrations(parse_or_default(&lookup, "AUTO_SYNC_MIGRATIONS", false)?)
            .collection_prefix(read_or_default(&lookup, "COLLECTION_PREFIX", ""))
            .migration_store(read_or_default(
                &lookup,
                "MIGRATION_STORE",
                DEFAULT_MIGRATION_STORE,
            ))
            .connect_timeout(Duration::from_secs(parse_or_default(
                &lookup,
                "STORE_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT.as_secs(),
            )?))
            .health_check_interval(Duration::from_secs(parse_or_default(
                &lookup,
                "STORE_HEALTH_CHECK_INTERVAL_SECS",
                DEFAULT_HEALTH_CHECK_INTERVAL.as_secs(),
            )?));

        if let Some(path) = read_non_empty(&lookup, "MIGRATIONS_MANIFEST") {
            builder = builder.migrations_manifest(path);
        }

        builder.build()
    }

    pub fn stores(&self) -> &[StoreSettings] {
        &self.stores
    }

    pub fn store(&self, name: &str) -> Option<&StoreSettings> {
        self.stores.iter().find(|store| store.name == name)
    }

    /// Whether the bootstrap applies pending migrations before starting the request layer.
    pub fn auto_sync_migrations(&self) -> bool {
        self.auto_sync_migrations
    }

    pub fn collection_prefix(&self) -> &str {
        &self.collection_prefix
    }

    /// Store the migration runner writes to.
    pub fn migration_store(&self) -> &str {
        &self.migration_store
    }

    pub fn migrations_manifest(&self) -> Option<&Path> {
        self.migrations_manifest.as_deref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// `_<prefix>migrations`.
    pub fn tracking_namespace(&self) -> String {
        tracking_namespace(&self.collection_prefix)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            connect_timeout: self.connect_timeout,
            health_check_interval: self.health_check_interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_stores(&self.stores)?;

        for required in [ACCOUNTS_STORE, DATA_STORE] {
            if self.store(required).is_none() {
                bail!("store {required} must be configured");
            }
        }

        if self.store(&self.migration_store).is_none() {
            bail!(
                "migration_store {} does not name a configured store",
                self.migration_store
            );
        }

        validate_namespace(&self.tracking_namespace())
            .context("collection_prefix produces an invalid tracking namespace")?;

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.health_check_interval.is_zero() {
            bail!("health_check_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ServiceConfigBuilder {
    stores: Vec<StoreSettings>,
    auto_sync_migrations: Option<bool>,
    collection_prefix: Option<String>,
    migration_store: Option<String>,
    migrations_manifest: Option<PathBuf>,
    connect_timeout: Option<Duration>,
    health_check_interval: Option<Duration>,
}

impl ServiceConfigBuilder {
    pub fn store(mut self, name: impl Into<String>, uri: impl Into<String>) -> Self {
        self.stores.push(StoreSettings::new(name, uri));
        self
    }

    pub fn auto_sync_migrations(mut self, enabled: bool) -> Self {
        self.auto_sync_migrations = Some(enabled);
        self
    }

    pub fn collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.collection_prefix = Some(prefix.into());
        self
    }

    pub fn migration_store(mut self, name: impl Into<String>) -> Self {
        self.migration_store = Some(name.into());
        self
    }

    pub fn migrations_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_manifest = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<ServiceConfig> {
        let config = ServiceConfig {
            stores: self.stores,
            auto_sync_migrations: self.auto_sync_migrations.unwrap_or(false),
            collection_prefix: self
                .collection_prefix
                .map(|prefix| prefix.trim().to_owned())
                .unwrap_or_default(),
            migration_store: self
                .migration_store
                .map(|name| name.trim().to_owned())
                .unwrap_or_else(|| DEFAULT_MIGRATION_STORE.to_owned()),
            migrations_manifest: self.migrations_manifest,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            health_check_interval: self
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Rejects empty store names or URIs and duplicate names.
pub(crate) fn validate_stores(stores: &[StoreSettings]) -> Result<()> {
    let mut seen = HashSet::new();
    for store in stores {
        if store.name.is_empty() {
            bail!("store name cannot be empty");
        }
        if store.uri.is_empty() {
            bail!("uri for store {} cannot be empty", store.name);
        }
        if !seen.insert(store.name.as_str()) {
            bail!("store {} is configured more than once", store.name);
        }
    }
    Ok(())
}

pub(crate) fn read_non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub(crate) fn read_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    read_non_empty(lookup, key).unwrap_or_else(|| default.to_owned())
}

pub(crate) fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match read_non_empty(lookup, key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        None => Ok(default),
    }
}
