use crate::migrations::manifest::MigrationManifest;
use crate::migrations::record::{validate_namespace, MigrationRecord};
use crate::runtime::telemetry::Telemetry;
use crate::store::connection::Store;
use anyhow::Error as AnyError;
use std::fmt;
use std::sync::Arc;

/// Failure that stopped a migration run. Every variant names where it happened.
#[derive(Debug)]
pub enum MigrationError {
    /// The tracking namespace could not be read.
    Tracking { namespace: String, source: AnyError },
    /// A unit's apply routine failed; no record was written for it.
    Apply { id: String, source: AnyError },
    /// A unit was applied but its record could not be written.
    Record { id: String, source: AnyError },
}

impl MigrationError {
    /// Id of the unit that failed, if the failure is tied to one.
    pub fn failed_unit(&self) -> Option<&str> {
        match self {
            MigrationError::Tracking { .. } => None,
            MigrationError::Apply { id, .. } | MigrationError::Record { id, .. } => Some(id),
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Tracking { namespace, source } => {
                write!(f, "failed to read tracking namespace {namespace}: {source}")
            }
            MigrationError::Apply { id, source } => {
                write!(f, "migration {id} failed to apply: {source}")
            }
            MigrationError::Record { id, source } => {
                write!(f, "migration {id} applied but could not be recorded: {source}")
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Tracking { source, .. }
            | MigrationError::Apply { source, .. }
            | MigrationError::Record { source, .. } => Some(source.as_ref()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub namespace: String,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Applies manifest units against one store, each at most once per tracking namespace.
///
/// Runs assume a single writer per namespace; two runners racing on the same namespace
/// are not coordinated.
pub struct MigrationRunner<'a> {
    store: &'a dyn Store,
    namespace: String,
    telemetry: Option<Arc<Telemetry>>,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(store: &'a dyn Store, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Applies pending units strictly in manifest order.
    ///
    /// Stops at the first failing unit: earlier units stay applied and recorded, the
    /// failing unit gets no record, later units are not attempted. A retry resumes at
    /// the failing unit.
    pub async fn run(&self, manifest: &MigrationManifest) -> Result<MigrationReport, MigrationError> {
        validate_namespace(&self.namespace).map_err(|source| MigrationError::Tracking {
            namespace: self.namespace.clone(),
            source,
        })?;

        let mut report = MigrationReport {
            namespace: self.namespace.clone(),
            ..MigrationReport::default()
        };

        for unit in manifest.units() {
            let id = unit.id();
            let already_applied = self
                .store
                .has_migration(&self.namespace, id)
                .await
                .map_err(|source| MigrationError::Tracking {
                    namespace: self.namespace.clone(),
                    source,
                })?;

            if already_applied {
                tracing::debug!(namespace = %self.namespace, migration = id, "migration already applied");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_migration_skipped();
                }
                report.skipped.push(id.to_owned());
                continue;
            }

            tracing::info!(namespace = %self.namespace, migration = id, "applying migration");
            if let Err(source) = unit.apply(self.store).await {
                tracing::error!(
                    namespace = %self.namespace,
                    migration = id,
                    error = %source,
                    "migration failed; stopping"
                );
                return Err(MigrationError::Apply {
                    id: id.to_owned(),
                    source,
                });
            }

            let record = MigrationRecord::new(id, self.namespace.clone());
            self.store
                .record_migration(&record)
                .await
                .map_err(|source| MigrationError::Record {
                    id: id.to_owned(),
                    source,
                })?;

            if let Some(telemetry) = &self.telemetry {
                telemetry.record_migration_applied();
            }
            report.applied.push(id.to_owned());
        }

        tracing::info!(
            namespace = %self.namespace,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migrations synchronized"
        );
        Ok(report)
    }
}
