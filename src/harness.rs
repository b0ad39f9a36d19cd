//! Integration-test harness: brings up the ledger node, contract deployment and the
//! service under test, then runs suites against the shared context.

pub mod broker;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod ledger;
pub mod orchestrator;
pub mod process;
pub mod readiness;

pub use broker::{BrokerConnector, ExchangeKind, ExchangeOptions, MemoryBroker};
pub use config::{HarnessConfig, LedgerEndpoint, ProcessSpec, ReadinessPolicy};
pub use context::{ContractRegistry, SharedContext, TestIdentity};
pub use dispatcher::{DispatchReport, SuiteDispatcher, SuiteOutcome};
pub use orchestrator::{Orchestrator, TeardownReport};
pub use process::{ManagedProcess, ProcessError, ProcessState};

use crate::runtime::fatal::ShutdownReason;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HarnessReport {
    pub dispatch: DispatchReport,
    pub teardown: TeardownReport,
    /// Set when a fatal condition or a signal cut the run short.
    pub shutdown: Option<ShutdownReason>,
}

impl HarnessReport {
    pub fn succeeded(&self) -> bool {
        self.shutdown.is_none() && self.dispatch.all_passed()
    }
}

pub struct Harness {
    config: HarnessConfig,
    broker: Arc<dyn BrokerConnector>,
    telemetry: Arc<Telemetry>,
}

impl Harness {
    /// Uses an in-process broker until [`Harness::with_broker`] supplies a real one.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            broker: Arc::new(MemoryBroker::new()),
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerConnector>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Brings the environment up, dispatches every suite and tears down. Teardown runs
    /// on every path; a failed bring-up is returned as the error.
    pub async fn run(self, dispatcher: &SuiteDispatcher) -> Result<HarnessReport> {
        let mut orchestrator = Orchestrator::new(self.config, self.broker, self.telemetry);
        let coordinator = orchestrator.coordinator().clone();
        let shutdown = coordinator.token();

        let signals = {
            let coordinator = coordinator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => {
                            coordinator.trigger(ShutdownReason::Signal);
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to listen for ctrl-c"),
                    },
                    _ = shutdown.cancelled() => {}
                }
            })
        };

        let outcome = match orchestrator.bring_up().await {
            Ok(context) => Ok(dispatcher.dispatch(context, &shutdown).await),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "harness bring-up failed");
                Err(err)
            }
        };

        signals.abort();
        let teardown = orchestrator.teardown().await;
        let dispatch = outcome?;

        Ok(HarnessReport {
            dispatch,
            teardown,
            shutdown: coordinator.reason(),
        })
    }
}
