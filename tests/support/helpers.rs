use std::{path::Path, time::Duration};

use anyhow::Result;
use middleware_bootstrap::harness::config::HarnessConfigBuilder;
use middleware_bootstrap::harness::{HarnessConfig, LedgerEndpoint, ProcessSpec, ReadinessPolicy};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub const OWNER_KEY: &str = "6b9027372deb53f4ae973a5614d8a57024adf33126ece6b587d9e08ba901c0d2";

pub fn fast_readiness() -> ReadinessPolicy {
    ReadinessPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        timeout: Duration::from_secs(5),
    }
}

pub fn harness_config(dir: &Path, ledger_url: &str) -> HarnessConfig {
    harness_builder(dir, ledger_url)
        .build()
        .expect("valid harness config")
}

/// Harness configuration rooted in `dir`: memory stores, an HTTP ledger at `ledger_url`,
/// and `sh -c` stand-ins for every helper process. The ledger stand-in only sleeps; the
/// mock server answers the readiness probe.
pub fn harness_builder(dir: &Path, ledger_url: &str) -> HarnessConfigBuilder {
    HarnessConfig::builder()
        .store("accounts", "memory://accounts")
        .store("data", "memory://data")
        .ledger(LedgerEndpoint::parse(ledger_url).expect("valid ledger url"))
        .ledger_process(ProcessSpec::shell("ledger", "sleep 30"))
        .deploy_process(ProcessSpec::shell(
            "contract-deploy",
            format!(
                "mkdir -p {build}/contracts && echo '{{\"contractName\": \"Wallet\", \"abi\": []}}' > {build}/contracts/Wallet.json && mkdir -p {db}",
                build = dir.join("build").display(),
                db = dir.join("db").display(),
            ),
        ))
        .service_process(ProcessSpec::shell(
            "service",
            format!(
                "sleep 0.2; echo '[{{\"id\": \"flow-1\"}}]' > {}; sleep 30",
                dir.join("flows.json").display()
            ),
        ))
        .contracts_build_dir(dir.join("build"))
        .ledger_db_dir(dir.join("db"))
        .contract("Wallet")
        .artifact_path(dir.join("flows.json"))
        .identity("owner", OWNER_KEY)
        .readiness(fast_readiness())
        .deploy_timeout(Duration::from_secs(10))
}

/// Lays out what a previous run leaves behind: deployed contracts, the ledger database
/// and the service artifact.
pub fn prepare_deployed(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir.join("build/contracts"))?;
    std::fs::write(
        dir.join("build/contracts/Wallet.json"),
        r#"{"contractName": "Wallet", "abi": []}"#,
    )?;
    std::fs::create_dir_all(dir.join("db"))?;
    std::fs::write(dir.join("flows.json"), r#"[{"id": "flow-1"}]"#)?;
    Ok(())
}
