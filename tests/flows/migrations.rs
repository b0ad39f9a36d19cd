use crate::support::helpers::init_tracing;
use anyhow::Result;
use middleware_bootstrap::migrations::{
    tracking_namespace, MigrationError, MigrationManifest, MigrationRunner, MigrationUnit,
    ScriptMigration,
};
use middleware_bootstrap::store::{SqliteStore, Store};

fn manifest(seed: &str) -> Result<MigrationManifest> {
    MigrationManifest::new(vec![
        Box::new(ScriptMigration::new(
            "001_init",
            ["CREATE TABLE IF NOT EXISTS accounts (address TEXT PRIMARY KEY);"],
        )) as Box<dyn MigrationUnit>,
        Box::new(ScriptMigration::new(
            "002_add_index",
            ["CREATE INDEX IF NOT EXISTS accounts_address ON accounts (address);"],
        )),
        Box::new(ScriptMigration::new("003_seed", [seed])),
    ])
}

#[tokio::test]
async fn failed_unit_resumes_on_retry() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let uri = format!("sqlite://{}", dir.path().join("data.db").display());
    let store = SqliteStore::open(&uri).await?;
    let namespace = tracking_namespace("");

    let broken = MigrationManifest::new(vec![
        Box::new(ScriptMigration::new(
            "001_init",
            ["CREATE TABLE accounts (address TEXT PRIMARY KEY);"],
        )) as Box<dyn MigrationUnit>,
        Box::new(ScriptMigration::new("002_add_index", ["CREATE INDEX broken ON missing (x);"])),
        Box::new(ScriptMigration::new(
            "003_seed",
            ["INSERT INTO accounts (address) VALUES ('0x01');"],
        )),
    ])?;

    let err = MigrationRunner::new(&store, namespace.clone())
        .run(&broken)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Apply { .. }));
    assert_eq!(err.failed_unit(), Some("002_add_index"));

    let records = store.migration_records(&namespace).await?;
    let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
    assert_eq!(ids, vec!["001_init"]);

    let report = MigrationRunner::new(&store, namespace.clone())
        .run(&manifest("INSERT INTO accounts (address) VALUES ('0x01');")?)
        .await?;
    assert_eq!(report.skipped, vec!["001_init"]);
    assert_eq!(report.applied, vec!["002_add_index", "003_seed"]);
    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn prefixes_keep_deployments_apart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let uri = format!("sqlite://{}", dir.path().join("shared.db").display());
    let store = SqliteStore::open(&uri).await?;
    let manifest = manifest("INSERT OR IGNORE INTO accounts (address) VALUES ('0x01');")?;

    let first = MigrationRunner::new(&store, tracking_namespace("alpha_"))
        .run(&manifest)
        .await?;
    let second = MigrationRunner::new(&store, tracking_namespace("beta_"))
        .run(&manifest)
        .await?;
    assert_eq!(first.applied_count(), 3);
    assert_eq!(second.applied_count(), 3);

    let again = MigrationRunner::new(&store, tracking_namespace("alpha_"))
        .run(&manifest)
        .await?;
    assert_eq!(again.applied_count(), 0);
    assert!(store.has_migration("_beta_migrations", "003_seed").await?);
    store.close().await?;
    Ok(())
}
