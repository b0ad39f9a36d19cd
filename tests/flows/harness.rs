use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{harness_builder, harness_config, init_tracing, prepare_deployed},
    mock_ledger::{MockLedger, MockLedgerServer},
};
use anyhow::{ensure, Context, Result};
use middleware_bootstrap::harness::{
    Harness, MemoryBroker, Orchestrator, ProcessError, ProcessSpec, ProcessState, SharedContext,
    SuiteDispatcher, SuiteOutcome, TeardownReport,
};
use middleware_bootstrap::{ShutdownReason, Telemetry};
use serde_json::Value;
use tokio::time::{sleep, timeout};

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_environment_deploys_and_runs_suites() -> Result<()> {
    init_tracing();
    let ledger = MockLedger::new(41);
    let server = MockLedgerServer::start(ledger.clone()).await?;
    let dir = tempfile::tempdir()?;
    let broker = MemoryBroker::new();

    let miner = ledger.clone();
    let mut dispatcher = SuiteDispatcher::new();
    dispatcher
        .register("block", move |context: Arc<SharedContext>| {
            let miner = miner.clone();
            async move {
                let block = context.ledger().block_number().await?;
                ensure!(block == 41, "unexpected block {block}");
                let mined = miner.mine();
                let block = context.ledger().block_number().await?;
                ensure!(block == mined, "ledger still at {block}, expected {mined}");
                let network: String = context.ledger().request("net_version", Vec::new()).await?;
                ensure!(network == "4", "unexpected network {network}");
                context.broker().publish("block.new", b"42").await
            }
        })
        .register("features", |context: Arc<SharedContext>| async move {
            ensure!(context.contracts().get("Wallet").is_some(), "Wallet missing");
            ensure!(context.identity("owner").is_some(), "owner identity missing");
            ensure!(
                context.flows()[0]["id"] == Value::from("flow-1"),
                "unexpected flows {}",
                context.flows()
            );
            let service = context.process("service").context("service not tracked")?;
            ensure!(!service.is_alive(), "service must be stopped after its artifact appears");
            let node = context.process("ledger").context("ledger not tracked")?;
            ensure!(node.state() == ProcessState::Running, "ledger is {:?}", node.state());
            context.stores().require("accounts")?;
            Ok(())
        });

    let report = timeout(
        RUN_TIMEOUT,
        Harness::new(harness_config(dir.path(), server.url()))
            .with_broker(Arc::new(broker.clone()))
            .run(&dispatcher),
    )
    .await??;

    assert!(report.succeeded(), "{}", report.dispatch);
    assert_eq!(report.shutdown, None);
    assert_eq!(
        report.teardown,
        TeardownReport {
            broker_closed: true,
            stores_closed: 2,
            ledger_closed: true,
            processes_killed: 1,
        }
    );
    assert!(dir.path().join("build/contracts/Wallet.json").exists());
    assert!(dir.path().join("flows.json").exists());
    assert_eq!(broker.connections_closed(), 1);
    assert_eq!(broker.published().len(), 1);
    assert!(ledger.calls() >= 4);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn existing_environment_skips_deploy_and_service() -> Result<()> {
    init_tracing();
    let server = MockLedgerServer::start(MockLedger::new(7)).await?;
    let dir = tempfile::tempdir()?;
    prepare_deployed(dir.path())?;

    let config = harness_builder(dir.path(), server.url())
        .deploy_process(ProcessSpec::shell("contract-deploy", "exit 9"))
        .service_process(ProcessSpec::shell("service", "exit 9"))
        .build()?;

    let mut dispatcher = SuiteDispatcher::new();
    dispatcher.register("features", |context: Arc<SharedContext>| async move {
        ensure!(context.process("contract-deploy").is_none(), "deploy ran");
        ensure!(context.process("service").is_none(), "service ran");
        Ok(())
    });

    let report = timeout(RUN_TIMEOUT, Harness::new(config).run(&dispatcher)).await??;
    assert!(report.succeeded(), "{}", report.dispatch);
    assert_eq!(report.teardown.processes_killed, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_exit_skips_remaining_suites() -> Result<()> {
    init_tracing();
    let server = MockLedgerServer::start(MockLedger::new(1)).await?;
    let dir = tempfile::tempdir()?;
    prepare_deployed(dir.path())?;
    let trigger = dir.path().join("kill-ledger");

    let config = harness_builder(dir.path(), server.url())
        .ledger_process(ProcessSpec::shell(
            "ledger",
            format!(
                "while [ ! -f {} ]; do sleep 0.05; done; exit 1",
                trigger.display()
            ),
        ))
        .build()?;

    let mut dispatcher = SuiteDispatcher::new();
    dispatcher
        .register("block", move |_context: Arc<SharedContext>| {
            let trigger = trigger.clone();
            async move {
                tokio::fs::write(&trigger, b"").await?;
                sleep(Duration::from_secs(20)).await;
                anyhow::Ok(())
            }
        })
        .register("features", |_context: Arc<SharedContext>| async { Ok(()) })
        .register("performance", |_context: Arc<SharedContext>| async { Ok(()) });

    let telemetry = Arc::new(Telemetry::default());
    let report = timeout(
        RUN_TIMEOUT,
        Harness::new(config)
            .with_telemetry(telemetry.clone())
            .run(&dispatcher),
    )
    .await??;

    assert!(!report.succeeded());
    assert!(matches!(
        report.dispatch.outcome("block"),
        Some(SuiteOutcome::Failed(_))
    ));
    assert_eq!(report.dispatch.skipped(), 2);
    match &report.shutdown {
        Some(ShutdownReason::ProcessExited { process, .. }) => assert_eq!(process, "ledger"),
        other => panic!("unexpected shutdown reason {other:?}"),
    }
    assert_eq!(report.teardown.processes_killed, 0);
    assert!(report.teardown.broker_closed);
    assert_eq!(telemetry.snapshot().process_failures, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_deploy_tears_down_once() -> Result<()> {
    init_tracing();
    let server = MockLedgerServer::start(MockLedger::new(1)).await?;
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("build/stale"))?;
    let broker = MemoryBroker::new();

    let config = harness_builder(dir.path(), server.url())
        .deploy_process(ProcessSpec::shell("contract-deploy", "exit 3"))
        .build()?;
    let mut orchestrator = Orchestrator::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(Telemetry::default()),
    );

    let err = timeout(RUN_TIMEOUT, orchestrator.bring_up())
        .await?
        .err()
        .context("bring-up should fail")?;
    match err.downcast_ref::<ProcessError>() {
        Some(ProcessError::Failed { process, status }) => {
            assert_eq!(process, "contract-deploy");
            assert!(status.contains('3'), "{status}");
        }
        other => panic!("unexpected error {other:?}: {err:#}"),
    }
    assert!(!dir.path().join("build/stale").exists(), "stale build dir must be removed");

    let ledger_node = orchestrator
        .processes()
        .iter()
        .find(|process| process.name() == "ledger")
        .cloned()
        .context("ledger not spawned")?;

    let report = orchestrator.teardown().await;
    assert_eq!(
        report,
        TeardownReport {
            broker_closed: true,
            stores_closed: 2,
            ledger_closed: false,
            processes_killed: 1,
        }
    );
    assert_eq!(orchestrator.teardown().await, TeardownReport::default());
    assert!(!ledger_node.is_alive());
    assert!(!orchestrator.coordinator().is_triggered());
    assert_eq!(broker.connections_closed(), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_exiting_before_artifact_is_fatal() -> Result<()> {
    init_tracing();
    let server = MockLedgerServer::start(MockLedger::new(1)).await?;
    let dir = tempfile::tempdir()?;
    prepare_deployed(dir.path())?;
    std::fs::remove_file(dir.path().join("flows.json"))?;
    let broker = MemoryBroker::new();

    let config = harness_builder(dir.path(), server.url())
        .service_process(ProcessSpec::shell("service", "exit 0"))
        .build()?;

    let mut dispatcher = SuiteDispatcher::new();
    dispatcher.register("block", |_context: Arc<SharedContext>| async { Ok(()) });

    let err = timeout(
        RUN_TIMEOUT,
        Harness::new(config)
            .with_broker(Arc::new(broker.clone()))
            .run(&dispatcher),
    )
    .await?
    .err()
    .context("harness should fail")?;

    assert!(
        matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::ExitedEarly { process, .. }) if process == "service"
        ),
        "{err:#}"
    );
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.connections_closed(), 1);

    server.shutdown().await;
    Ok(())
}
