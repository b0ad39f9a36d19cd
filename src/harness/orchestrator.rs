//! Brings the integration environment up in dependency order and tears it down.
//!
//! Order: stores, broker, ledger node, contract deployment (only when the build or
//! ledger database is missing), service under test (only when its artifact is
//! missing), then the ledger client. Every resource acquired along the way is
//! recorded so [`Orchestrator::teardown`] can release it exactly once, whether or
//! not bring-up finished.

use crate::harness::broker::{BrokerConnection, BrokerConnector, ExchangeKind, ExchangeOptions};
use crate::harness::config::{HarnessConfig, ProcessSpec};
use crate::harness::context::{BrokerSession, ContractRegistry, SharedContext};
use crate::harness::ledger::LedgerClient;
use crate::harness::process::{ManagedProcess, ProcessError};
use crate::harness::readiness::{ledger_probe, wait_until_ready, FileProbe};
use crate::runtime::fatal::ShutdownCoordinator;
use crate::runtime::telemetry::Telemetry;
use crate::store::registry::{ConnectionRegistry, RegistryOptions};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// What a teardown call actually released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub broker_closed: bool,
    pub stores_closed: usize,
    pub ledger_closed: bool,
    pub processes_killed: usize,
}

pub struct Orchestrator {
    config: HarnessConfig,
    broker: Arc<dyn BrokerConnector>,
    telemetry: Arc<Telemetry>,
    coordinator: ShutdownCoordinator,
    stores: Arc<ConnectionRegistry>,
    broker_connection: Option<Arc<dyn BrokerConnection>>,
    ledger: Option<Arc<LedgerClient>>,
    processes: Vec<Arc<ManagedProcess>>,
    disconnect_listener: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl Orchestrator {
    pub fn new(
        config: HarnessConfig,
        broker: Arc<dyn BrokerConnector>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new(), telemetry.clone());
        let stores = Arc::new(ConnectionRegistry::new(
            RegistryOptions {
                connect_timeout: config.connect_timeout(),
                ..RegistryOptions::default()
            },
            telemetry.clone(),
        ));

        Self {
            config,
            broker,
            telemetry,
            coordinator,
            stores,
            broker_connection: None,
            ledger: None,
            processes: Vec::new(),
            disconnect_listener: None,
            torn_down: false,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Fatal conditions during bring-up or dispatch (ledger exit, store loss) land here.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Store registry used by the harness. Extra connectors can be registered before
    /// [`Orchestrator::bring_up`].
    pub fn stores(&self) -> &Arc<ConnectionRegistry> {
        &self.stores
    }

    pub fn processes(&self) -> &[Arc<ManagedProcess>] {
        &self.processes
    }

    pub async fn bring_up(&mut self) -> Result<Arc<SharedContext>> {
        if self.torn_down {
            bail!("harness environment was already torn down");
        }
        let shutdown = self.coordinator.token();

        self.disconnect_listener = Some(
            self.coordinator
                .spawn_disconnect_listener(self.stores.disconnect_events()),
        );
        self.stores
            .open_all(self.config.stores())
            .await
            .context("failed to open harness stores")?;

        let connection = self
            .broker
            .connect(self.config.broker_url())
            .await
            .with_context(|| format!("failed to connect to broker {}", self.config.broker_url()))?;
        self.broker_connection = Some(connection.clone());
        let channel = connection
            .create_channel()
            .await
            .context("failed to open broker channel")?;
        channel
            .assert_exchange(
                self.config.exchange(),
                ExchangeKind::Topic,
                ExchangeOptions { durable: false },
            )
            .await
            .with_context(|| format!("failed to assert exchange {}", self.config.exchange()))?;
        tracing::info!(exchange = %self.config.exchange(), "broker channel ready");

        // Checked before the node starts; the node creates its database on boot.
        let ledger_db_present = path_exists(self.config.ledger_db_dir()).await;

        let spec = self.config.ledger_process().clone();
        let ledger_node = self.launch(&spec, true)?;
        let probe = ledger_probe(self.config.ledger())?;
        wait_until_ready(
            &ledger_node,
            probe.as_ref(),
            self.config.readiness(),
            &shutdown,
        )
        .await?;
        ledger_node.mark_running();

        let build_dir = self.config.contracts_build_dir().to_path_buf();
        let build_present = path_exists(&build_dir).await;
        if !build_present || !ledger_db_present {
            if build_present {
                tokio::fs::remove_dir_all(&build_dir).await.with_context(|| {
                    format!("failed to remove stale build dir {}", build_dir.display())
                })?;
            }
            self.deploy_contracts(&shutdown).await?;
        } else {
            tracing::info!(build_dir = %build_dir.display(), "contracts already deployed");
        }

        let artifact = self.config.artifact_path().to_path_buf();
        if !path_exists(&artifact).await {
            let spec = self.config.service_process().clone();
            let service = self.launch(&spec, false)?;
            let ready = wait_until_ready(
                &service,
                &FileProbe::new(&artifact),
                self.config.readiness(),
                &shutdown,
            )
            .await;
            service.stop().await;
            ready?;
        }

        let flows = tokio::fs::read_to_string(&artifact)
            .await
            .with_context(|| format!("failed to read {}", artifact.display()))?;
        let flows: Value = serde_json::from_str(&flows)
            .with_context(|| format!("{} is not valid json", artifact.display()))?;

        let contracts =
            ContractRegistry::load(&self.config.contracts_dir(), self.config.contracts()).await?;
        let identities = self
            .config
            .identities()
            .iter()
            .map(|identity| (identity.name().to_owned(), identity.clone()))
            .collect::<BTreeMap<_, _>>();

        let ledger = Arc::new(
            LedgerClient::connect(self.config.ledger().clone(), self.config.connect_timeout())
                .await
                .context("failed to connect ledger client")?,
        );
        self.ledger = Some(ledger.clone());

        if let Some(reason) = self.coordinator.reason() {
            bail!("harness shut down during bring-up: {reason}");
        }

        tracing::info!(
            stores = self.stores.names().len(),
            contracts = contracts.len(),
            identities = identities.len(),
            processes = self.processes.len(),
            "harness environment ready"
        );

        Ok(Arc::new(SharedContext {
            broker: BrokerSession::new(channel, self.config.exchange()),
            ledger,
            contracts,
            identities,
            flows,
            stores: self.stores.clone(),
            processes: self.processes.clone(),
            telemetry: self.telemetry.clone(),
        }))
    }

    /// Closes the broker connection, the stores and the ledger client, then kills every
    /// live process. Only the first call releases anything.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if std::mem::replace(&mut self.torn_down, true) {
            return report;
        }

        if let Some(connection) = self.broker_connection.take() {
            match connection.close().await {
                Ok(()) => report.broker_closed = true,
                Err(err) => tracing::warn!(error = %err, "failed to close broker connection"),
            }
        }

        report.stores_closed = self.stores.close_all().await;
        if let Some(listener) = self.disconnect_listener.take() {
            listener.abort();
            let _ = listener.await;
        }

        if let Some(ledger) = self.ledger.take() {
            report.ledger_closed = ledger.close().await;
        }

        for process in self.processes.drain(..) {
            if process.stop().await {
                report.processes_killed += 1;
            }
        }

        tracing::info!(
            broker_closed = report.broker_closed,
            stores_closed = report.stores_closed,
            ledger_closed = report.ledger_closed,
            processes_killed = report.processes_killed,
            "harness environment torn down"
        );
        self.telemetry.log_snapshot("harness teardown");
        report
    }

    async fn deploy_contracts(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let spec = self.config.deploy_process().clone();
        let deploy = self.launch(&spec, false)?;
        let deadline = self.config.deploy_timeout();

        let exit = tokio::select! {
            waited = timeout(deadline, deploy.wait_for_exit()) => match waited {
                Ok(exit) => exit,
                Err(_) => bail!("{} did not finish within {deadline:?}", spec.name),
            },
            _ = shutdown.cancelled() => bail!("shutdown requested while {} was running", spec.name),
        };

        if !exit.success() {
            return Err(ProcessError::Failed {
                process: spec.name,
                status: exit.describe(),
            }
            .into());
        }
        tracing::info!(process = %spec.name, "contracts deployed");
        Ok(())
    }

    fn launch(&mut self, spec: &ProcessSpec, supervised: bool) -> Result<Arc<ManagedProcess>> {
        let supervisor = supervised.then(|| self.coordinator.clone());
        let process = Arc::new(ManagedProcess::spawn(
            spec,
            supervisor,
            self.telemetry.clone(),
        )?);
        self.processes.push(process.clone());
        Ok(process)
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::broker::MemoryBroker;
    use crate::harness::config::{LedgerEndpoint, ReadinessPolicy};
    use crate::runtime::fatal::ShutdownReason;
    use std::time::Duration;

    fn config(dir: &Path, ledger_script: &str) -> HarnessConfig {
        HarnessConfig::builder()
            .store("accounts", "memory://orchestrator-accounts")
            .store("data", "memory://orchestrator-data")
            .ledger(LedgerEndpoint::Ipc(dir.join("ledger.ipc")))
            .ledger_process(ProcessSpec::shell("ledger", ledger_script))
            .contracts_build_dir(dir.join("build"))
            .ledger_db_dir(dir.join("db"))
            .artifact_path(dir.join("flows.json"))
            .readiness(ReadinessPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                timeout: Duration::from_secs(2),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn refused_broker_still_releases_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let mut orchestrator = Orchestrator::new(
            config(dir.path(), "sleep 30"),
            Arc::new(broker.clone()),
            Arc::new(Telemetry::default()),
        );

        let err = orchestrator.bring_up().await.unwrap_err();
        assert!(format!("{err:#}").contains("broker"));
        assert!(orchestrator.processes().is_empty());

        let report = orchestrator.teardown().await;
        assert_eq!(
            report,
            TeardownReport {
                broker_closed: false,
                stores_closed: 2,
                ledger_closed: false,
                processes_killed: 0,
            }
        );
        assert_eq!(orchestrator.teardown().await, TeardownReport::default());
        assert!(orchestrator.bring_up().await.is_err());
    }

    #[tokio::test]
    async fn ledger_exit_during_readiness_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let mut orchestrator = Orchestrator::new(
            config(dir.path(), "exit 4"),
            Arc::new(broker.clone()),
            Arc::new(Telemetry::default()),
        );

        assert!(orchestrator.bring_up().await.is_err());
        assert!(matches!(
            orchestrator.coordinator().reason(),
            Some(ShutdownReason::ProcessExited { ref process, .. }) if process == "ledger"
        ));

        let report = orchestrator.teardown().await;
        assert!(report.broker_closed);
        assert_eq!(report.processes_killed, 0);
        assert_eq!(broker.connections_closed(), 1);
    }
}
