use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Counters covering the bootstrap and harness lifecycle.
#[derive(Default, Debug)]
pub struct Telemetry {
    stores_opened: AtomicU64,
    store_disconnects: AtomicU64,
    migrations_applied: AtomicU64,
    migrations_skipped: AtomicU64,
    processes_spawned: AtomicU64,
    process_failures: AtomicU64,
    suites_passed: AtomicU64,
    suites_failed: AtomicU64,
    suites_skipped: AtomicU64,
}

impl Telemetry {
    pub fn record_store_opened(&self) {
        self.stores_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_disconnect(&self) {
        self.store_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_applied(&self) {
        self.migrations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_skipped(&self) {
        self.migrations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_spawned(&self) {
        self.processes_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_failure(&self) {
        self.process_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suite_passed(&self) {
        self.suites_passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suite_failed(&self) {
        self.suites_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suite_skipped(&self) {
        self.suites_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            stores_opened: self.stores_opened.load(Ordering::Relaxed),
            store_disconnects: self.store_disconnects.load(Ordering::Relaxed),
            migrations_applied: self.migrations_applied.load(Ordering::Relaxed),
            migrations_skipped: self.migrations_skipped.load(Ordering::Relaxed),
            processes_spawned: self.processes_spawned.load(Ordering::Relaxed),
            process_failures: self.process_failures.load(Ordering::Relaxed),
            suites_passed: self.suites_passed.load(Ordering::Relaxed),
            suites_failed: self.suites_failed.load(Ordering::Relaxed),
            suites_skipped: self.suites_skipped.load(Ordering::Relaxed),
        }
    }

    /// Emits the current counters as a single structured log line.
    pub fn log_snapshot(&self, context: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "middleware_bootstrap::metrics",
            context,
            stores_opened = snapshot.stores_opened,
            store_disconnects = snapshot.store_disconnects,
            migrations_applied = snapshot.migrations_applied,
            migrations_skipped = snapshot.migrations_skipped,
            processes_spawned = snapshot.processes_spawned,
            process_failures = snapshot.process_failures,
            suites_passed = snapshot.suites_passed,
            suites_failed = snapshot.suites_failed,
            suites_skipped = snapshot.suites_skipped,
            "lifecycle metrics snapshot"
        );
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub stores_opened: u64,
    pub store_disconnects: u64,
    pub migrations_applied: u64,
    pub migrations_skipped: u64,
    pub processes_spawned: u64,
    pub process_failures: u64,
    pub suites_passed: u64,
    pub suites_failed: u64,
    pub suites_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_store_opened();
        telemetry.record_store_opened();
        telemetry.record_store_disconnect();
        telemetry.record_migration_applied();
        telemetry.record_migration_skipped();
        telemetry.record_migration_skipped();
        telemetry.record_process_spawned();
        telemetry.record_process_failure();
        telemetry.record_suite_passed();
        telemetry.record_suite_failed();
        telemetry.record_suite_skipped();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.stores_opened, 2);
        assert_eq!(snapshot.store_disconnects, 1);
        assert_eq!(snapshot.migrations_applied, 1);
        assert_eq!(snapshot.migrations_skipped, 2);
        assert_eq!(snapshot.processes_spawned, 1);
        assert_eq!(snapshot.process_failures, 1);
        assert_eq!(snapshot.suites_passed, 1);
        assert_eq!(snapshot.suites_failed, 1);
        assert_eq!(snapshot.suites_skipped, 1);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        Telemetry::default().log_snapshot("test");
    }
}
