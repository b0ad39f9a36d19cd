pub mod harness;
pub mod migrations;
pub mod runtime;
pub mod store;

pub use harness::{
    Harness, HarnessConfig, HarnessReport, Orchestrator, SharedContext, SuiteDispatcher,
    SuiteOutcome,
};
pub use migrations::{MigrationError, MigrationManifest, MigrationRunner, MigrationUnit};
pub use runtime::backoff::DeadlineElapsed;
pub use runtime::bootstrap::{
    Bootstrap, BootstrapError, BootstrapStage, ModelBindings, RequestLayer, RunningService,
};
pub use runtime::config::{ServiceConfig, ServiceConfigBuilder, StoreSettings};
pub use runtime::fatal::{ShutdownCoordinator, ShutdownReason};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{ConnectionRegistry, Store, StoreError};
