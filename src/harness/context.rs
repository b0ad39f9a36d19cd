//! The aggregate handed to every suite once the environment is up.

use crate::harness::broker::BrokerChannel;
use crate::harness::config::LedgerEndpoint;
use crate::harness::ledger::LedgerClient;
use crate::harness::process::ManagedProcess;
use crate::runtime::telemetry::Telemetry;
use crate::store::registry::ConnectionRegistry;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

const PRIVATE_KEY_LEN: usize = 32;

/// Named wallet material used by suites to sign as a known actor.
#[derive(Clone, PartialEq, Eq)]
pub struct TestIdentity {
    name: String,
    secret: [u8; PRIVATE_KEY_LEN],
}

impl TestIdentity {
    /// Decodes a 32-byte private key from hex, with or without a `0x` prefix.
    pub fn from_hex(name: &str, private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits).context("private key is not valid hex")?;
        let secret: [u8; PRIVATE_KEY_LEN] = match bytes.try_into() {
            Ok(secret) => secret,
            Err(bytes) => bail!(
                "private key must be {PRIVATE_KEY_LEN} bytes, got {}",
                bytes.len()
            ),
        };
        if secret.iter().all(|byte| *byte == 0) {
            bail!("private key cannot be zero");
        }
        Ok(Self {
            name: name.to_owned(),
            secret,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secret(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.secret
    }
}

impl fmt::Debug for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestIdentity")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Compiled contract artifact (`<name>.json` in the contract build directory).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContractInterface {
    #[serde(rename = "contractName", default)]
    pub name: String,
    #[serde(default)]
    pub abi: Vec<Value>,
    #[serde(default)]
    pub bytecode: Option<String>,
    #[serde(default)]
    pub networks: BTreeMap<String, Value>,
}

impl ContractInterface {
    /// Deployed address on `network_id`, if the artifact records one.
    pub fn address(&self, network_id: &str) -> Option<&str> {
        self.networks
            .get(network_id)
            .and_then(|network| network.get("address"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, ContractInterface>,
}

impl ContractRegistry {
    /// Loads `<dir>/<name>.json` for every listed contract.
    pub async fn load(dir: &Path, names: &[String]) -> Result<Self> {
        let mut contracts = BTreeMap::new();
        for name in names {
            let path = dir.join(format!("{name}.json"));
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read contract artifact {}", path.display()))?;
            let mut interface: ContractInterface = serde_json::from_str(&contents)
                .with_context(|| format!("invalid contract artifact {}", path.display()))?;
            if interface.name.is_empty() {
                interface.name = name.clone();
            }
            contracts.insert(name.clone(), interface);
        }
        Ok(Self { contracts })
    }

    pub fn get(&self, name: &str) -> Option<&ContractInterface> {
        self.contracts.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// Broker channel bound to the harness exchange. The only handle suites write through.
#[derive(Clone)]
pub struct BrokerSession {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
}

impl BrokerSession {
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.channel
            .publish(&self.exchange, routing_key, payload)
            .await
    }
}

/// Fully initialized test environment. Built once by the orchestrator, then shared
/// read-only as `Arc<SharedContext>`.
pub struct SharedContext {
    pub(crate) broker: BrokerSession,
    pub(crate) ledger: Arc<LedgerClient>,
    pub(crate) contracts: ContractRegistry,
    pub(crate) identities: BTreeMap<String, TestIdentity>,
    pub(crate) flows: Value,
    pub(crate) stores: Arc<ConnectionRegistry>,
    pub(crate) processes: Vec<Arc<ManagedProcess>>,
    pub(crate) telemetry: Arc<Telemetry>,
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = match self.ledger.endpoint() {
            LedgerEndpoint::Http { url, .. } => url.clone(),
            LedgerEndpoint::Ipc(path) => path.display().to_string(),
        };
        let processes: Vec<_> = self.processes.iter().map(|process| process.name()).collect();
        f.debug_struct("SharedContext")
            .field("exchange", &self.broker.exchange())
            .field("ledger", &ledger)
            .field("contracts", &self.contracts.names().collect::<Vec<_>>())
            .field("identities", &self.identities.keys().collect::<Vec<_>>())
            .field("stores", &self.stores.names())
            .field("processes", &processes)
            .finish()
    }
}

impl SharedContext {
    pub fn broker(&self) -> &BrokerSession {
        &self.broker
    }

    pub fn ledger(&self) -> &Arc<LedgerClient> {
        &self.ledger
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn identity(&self, name: &str) -> Option<&TestIdentity> {
        self.identities.get(name)
    }

    /// Parsed service artifact (`flows.json`).
    pub fn flows(&self) -> &Value {
        &self.flows
    }

    pub fn stores(&self) -> &Arc<ConnectionRegistry> {
        &self.stores
    }

    pub fn process(&self, name: &str) -> Option<&Arc<ManagedProcess>> {
        self.processes.iter().find(|process| process.name() == name)
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }
}

#[cfg(test)]
pub(crate) async fn fixture() -> Arc<SharedContext> {
    use crate::harness::broker::{BrokerConnector, ExchangeKind, ExchangeOptions, MemoryBroker};
    use crate::store::registry::RegistryOptions;
    use std::time::Duration;

    let broker = MemoryBroker::new();
    let channel = broker
        .connect("memory://broker")
        .await
        .unwrap()
        .create_channel()
        .await
        .unwrap();
    channel
        .assert_exchange("events", ExchangeKind::Topic, ExchangeOptions::default())
        .await
        .unwrap();
    let telemetry = Arc::new(Telemetry::default());
    let ledger = LedgerClient::connect(
        LedgerEndpoint::parse("http://127.0.0.1:9").unwrap(),
        Duration::from_millis(200),
    )
    .await
    .unwrap();

    Arc::new(SharedContext {
        broker: BrokerSession::new(channel, "events"),
        ledger: Arc::new(ledger),
        contracts: ContractRegistry::default(),
        identities: BTreeMap::new(),
        flows: Value::Null,
        stores: Arc::new(ConnectionRegistry::new(
            RegistryOptions::default(),
            telemetry.clone(),
        )),
        processes: Vec::new(),
        telemetry,
    })
}
