//! SQLite-backed store. Statements run on the blocking pool behind a mutex-guarded
//! connection; each tracking namespace is its own table.

use crate::migrations::record::{validate_namespace, MigrationRecord};
use crate::store::connection::Store;
use crate::store::registry::StoreConnector;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tokio::task;

pub const SQLITE_SCHEME: &str = "sqlite";
const IN_MEMORY_URI: &str = "sqlite::memory:";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    location: String,
    conn: Arc<Mutex<Option<SqliteConnection>>>,
}

impl SqliteStore {
    /// Opens `sqlite://<path>` or `sqlite::memory:`.
    pub async fn open(uri: &str) -> Result<Self> {
        let location = parse_location(uri)?;
        let target = location.clone();
        let conn = task::spawn_blocking(move || -> Result<SqliteConnection> {
            if target == ":memory:" {
                return SqliteConnection::open_in_memory()
                    .context("failed to open in-memory sqlite database");
            }
            let conn = SqliteConnection::open(&target)
                .with_context(|| format!("failed to open sqlite database {target}"))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .context("failed to enable WAL mode")?;
            Ok(conn)
        })
        .await
        .context("sqlite open task panicked")??;

        Ok(Self {
            location,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection poisoned"))?;
            let connection = guard
                .as_mut()
                .ok_or_else(|| anyhow!("sqlite connection is closed"))?;
            op(connection)
        })
        .await
        .context("sqlite task panicked")?
    }
}

fn parse_location(uri: &str) -> Result<String> {
    if uri == IN_MEMORY_URI {
        return Ok(":memory:".to_owned());
    }
    match uri.strip_prefix("sqlite://") {
        Some(path) if !path.trim().is_empty() => Ok(path.to_owned()),
        _ => bail!("sqlite uri must be sqlite://<path> or {IN_MEMORY_URI}, got {uri}"),
    }
}

fn ensure_tracking_table(conn: &SqliteConnection, namespace: &str) -> Result<()> {
    validate_namespace(namespace)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{namespace}\" (
            id TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );"
    ))
    .with_context(|| format!("failed to create tracking table {namespace}"))
}

impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        SQLITE_SCHEME
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .context("sqlite ping failed")?;
            Ok(())
        }))
    }

    fn execute<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, Result<()>> {
        let statement = statement.to_owned();
        Box::pin(self.blocking(move |conn| {
            conn.execute_batch(&statement)
                .context("sqlite statement failed")
        }))
    }

    fn has_migration<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        let namespace = namespace.to_owned();
        let id = id.to_owned();
        Box::pin(self.blocking(move |conn| {
            ensure_tracking_table(conn, &namespace)?;
            let found = conn
                .query_row(
                    &format!("SELECT 1 FROM \"{namespace}\" WHERE id = ?1"),
                    params![id],
                    |_| Ok(()),
                )
                .optional()
                .context("failed to query tracking table")?;
            Ok(found.is_some())
        }))
    }

    fn record_migration<'a>(&'a self, record: &'a MigrationRecord) -> BoxFuture<'a, Result<()>> {
        let record = record.clone();
        Box::pin(self.blocking(move |conn| {
            ensure_tracking_table(conn, &record.namespace)?;
            conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (id, applied_at) VALUES (?1, ?2)",
                    record.namespace
                ),
                params![record.id, record.applied_at.to_rfc3339()],
            )
            .with_context(|| {
                format!(
                    "failed to record migration {} in {}",
                    record.id, record.namespace
                )
            })?;
            Ok(())
        }))
    }

    fn migration_records<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Vec<MigrationRecord>>> {
        let namespace = namespace.to_owned();
        Box::pin(self.blocking(move |conn| {
            ensure_tracking_table(conn, &namespace)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT id, applied_at FROM \"{namespace}\" ORDER BY id"
                ))
                .context("failed to prepare tracking query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("failed to read tracking table")?;

            let mut records = Vec::new();
            for row in rows {
                let (id, applied_at) = row.context("failed to decode tracking row")?;
                let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                    .with_context(|| format!("invalid applied_at for migration {id}"))?
                    .with_timezone(&Utc);
                records.push(MigrationRecord {
                    id,
                    namespace: namespace.clone(),
                    applied_at,
                });
            }
            Ok(records)
        }))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            task::spawn_blocking(move || {
                let taken = conn
                    .lock()
                    .map_err(|_| anyhow!("sqlite connection poisoned"))?
                    .take();
                if let Some(connection) = taken {
                    connection
                        .close()
                        .map_err(|(_, err)| anyhow!("failed to close sqlite connection: {err}"))?;
                }
                Ok(())
            })
            .await
            .context("sqlite close task panicked")?
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteConnector;

impl StoreConnector for SqliteConnector {
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Arc<dyn Store>>> {
        Box::pin(async move {
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(uri).await?);
            Ok(store)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_uris() {
        assert_eq!(parse_location("sqlite::memory:").unwrap(), ":memory:");
        assert_eq!(
            parse_location("sqlite:///tmp/data.db").unwrap(),
            "/tmp/data.db"
        );
        assert!(parse_location("sqlite://").is_err());
        assert!(parse_location("mongodb://localhost/data").is_err());
    }

    #[tokio::test]
    async fn tracks_migrations_per_table() {
        let store = SqliteStore::open(IN_MEMORY_URI).await.unwrap();
        store.ping().await.unwrap();
        store
            .execute("CREATE TABLE accounts (address TEXT PRIMARY KEY);")
            .await
            .unwrap();

        let record = MigrationRecord::new("001_init", "_a_migrations");
        store.record_migration(&record).await.unwrap();

        assert!(store.has_migration("_a_migrations", "001_init").await.unwrap());
        assert!(!store.has_migration("_b_migrations", "001_init").await.unwrap());

        let records = store.migration_records("_a_migrations").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "001_init");
        assert_eq!(
            records[0].applied_at.timestamp(),
            record.applied_at.timestamp()
        );

        assert!(store.record_migration(&record).await.is_err());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}", dir.path().join("data.db").display());

        let store = SqliteStore::open(&uri).await.unwrap();
        store
            .record_migration(&MigrationRecord::new("001_init", "_migrations"))
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(store.ping().await.is_err());

        let reopened = SqliteStore::open(&uri).await.unwrap();
        assert!(reopened.has_migration("_migrations", "001_init").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_hostile_namespaces() {
        let store = SqliteStore::open(IN_MEMORY_URI).await.unwrap();
        let err = store
            .has_migration("x\"; DROP TABLE y; --", "001")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid character"));
    }
}
