//! Tracked, idempotent migrations: manifests of units, the per-namespace record
//! format, and the sequential runner.

pub mod manifest;
pub mod record;
pub mod runner;

pub use manifest::{FnMigration, MigrationManifest, MigrationUnit, OrderingKey, ScriptMigration};
pub use record::{tracking_namespace, MigrationRecord};
pub use runner::{MigrationError, MigrationReport, MigrationRunner};
