use crate::harness::context::TestIdentity;
use crate::runtime::config::{
    parse_or_default, read_non_empty, read_or_default, validate_stores, StoreSettings,
    ACCOUNTS_STORE, DATA_STORE,
};
use crate::store::registry::DEFAULT_CONNECT_TIMEOUT;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_EXCHANGE: &str = "events";
pub const DEFAULT_LEDGER_IPC_PATH: &str = "/tmp/development/geth.ipc";
const DEFAULT_BROKER_URL: &str = "memory://broker";
const DEFAULT_ARTIFACT_PATH: &str = "flows.json";
const DEFAULT_CONTRACTS_ROOT: &str = "node_modules/chronobank-smart-contracts";
const DEFAULT_LEDGER_DB_DIR: &str = "tests/utils/node/testrpc_db";
const DEFAULT_READINESS_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_READINESS_MAX_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);

/// Where the ledger node answers JSON-RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEndpoint {
    Http {
        url: String,
        user: Option<String>,
        password: Option<String>,
    },
    Ipc(PathBuf),
}

impl LedgerEndpoint {
    /// `http://` and `https://` URIs select JSON-RPC over HTTP (credentials embedded as
    /// `user:password@` are split out); anything else is an IPC socket path.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            bail!("ledger endpoint cannot be empty");
        }

        let Some((scheme, rest)) = uri.split_once("://") else {
            return Ok(LedgerEndpoint::Ipc(PathBuf::from(uri)));
        };
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            bail!("unsupported ledger endpoint scheme {scheme}");
        }

        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        let (credentials, host) = match authority.rsplit_once('@') {
            Some((credentials, host)) => (Some(credentials), host),
            None => (None, authority),
        };
        if host.is_empty() {
            bail!("ledger endpoint {uri} has no host");
        }

        let (user, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (Some(user.to_owned()), Some(password.to_owned())),
                None => (Some(credentials.to_owned()), None),
            },
            None => (None, None),
        };

        Ok(LedgerEndpoint::Http {
            url: format!("{scheme}://{host}{path}"),
            user,
            password,
        })
    }

    /// `WEB3_TEST_URI`, then `WEB3_URI`, then the development IPC socket.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let uri = read_non_empty(lookup, "WEB3_TEST_URI")
            .or_else(|| read_non_empty(lookup, "WEB3_URI"))
            .unwrap_or_else(|| DEFAULT_LEDGER_IPC_PATH.to_owned());
        Self::parse(&uri)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, LedgerEndpoint::Http { .. })
    }
}

/// Command line of one helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    /// Forward the child's stdout/stderr to ours instead of discarding them.
    pub inherit_output: bool,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            inherit_output: false,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("process name cannot be empty");
        }
        if self.program.trim().is_empty() {
            bail!("program for process {} cannot be empty", self.name);
        }
        Ok(())
    }
}

/// Backoff and deadline applied to readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_READINESS_INITIAL_DELAY,
            max_delay: DEFAULT_READINESS_MAX_DELAY,
            timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

impl ReadinessPolicy {
    fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            bail!("readiness initial_delay must be greater than 0");
        }
        if self.max_delay < self.initial_delay {
            bail!("readiness max_delay must be at least initial_delay");
        }
        if self.timeout.is_zero() {
            bail!("readiness timeout must be greater than 0");
        }
        Ok(())
    }
}

/// Everything the orchestrator needs to bring the test environment up.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    stores: Vec<StoreSettings>,
    broker_url: String,
    exchange: String,
    ledger: LedgerEndpoint,
    ledger_process: ProcessSpec,
    deploy_process: ProcessSpec,
    service_process: ProcessSpec,
    contracts_build_dir: PathBuf,
    ledger_db_dir: PathBuf,
    contracts: Vec<String>,
    artifact_path: PathBuf,
    identities: Vec<TestIdentity>,
    readiness: ReadinessPolicy,
    deploy_timeout: Duration,
    connect_timeout: Duration,
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Reads the harness configuration from the environment.
    ///
    /// Stores come from `ACCOUNTS_STORE_URI`/`DATA_STORE_URI`, the broker from
    /// `RABBIT_URI`, the ledger from `WEB3_TEST_URI`/`WEB3_URI`, identities from
    /// `OWNER_PRIVATE_KEY` and `ORACLE_PRIVATE_KEY`, the service artifact from
    /// `FLOWS_PATH`, and the deployed contracts to load from the comma-separated
    /// `HARNESS_CONTRACTS`. Process command lines keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder()
            .store(
                ACCOUNTS_STORE,
                read_or_default(&lookup, "ACCOUNTS_STORE_URI", "memory://accounts"),
            )
            .store(
                DATA_STORE,
                read_or_default(&lookup, "DATA_STORE_URI", "memory://data"),
            )
            .broker_url(read_or_default(&lookup, "RABBIT_URI", DEFAULT_BROKER_URL))
            .ledger(LedgerEndpoint::from_lookup(&lookup)?)
            .artifact_path(read_or_default(
                &lookup,
                "FLOWS_PATH",
                DEFAULT_ARTIFACT_PATH,
            ))
            .readiness_timeout(Duration::from_secs(parse_or_default(
                &lookup,
                "HARNESS_READINESS_TIMEOUT_SECS",
                DEFAULT_READINESS_TIMEOUT.as_secs(),
            )?));

        if let Some(key) = read_non_empty(&lookup, "OWNER_PRIVATE_KEY") {
            builder = builder.identity("owner", key);
        }
        if let Some(key) = read_non_empty(&lookup, "ORACLE_PRIVATE_KEY") {
            builder = builder.identity("middleware", key);
        }
        if let Some(contracts) = read_non_empty(&lookup, "HARNESS_CONTRACTS") {
            for name in contracts.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                builder = builder.contract(name);
            }
        }

        builder.build()
    }

    pub fn stores(&self) -> &[StoreSettings] {
        &self.stores
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Topic exchange asserted on the broker channel.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn ledger(&self) -> &LedgerEndpoint {
        &self.ledger
    }

    pub fn ledger_process(&self) -> &ProcessSpec {
        &self.ledger_process
    }

    pub fn deploy_process(&self) -> &ProcessSpec {
        &self.deploy_process
    }

    pub fn service_process(&self) -> &ProcessSpec {
        &self.service_process
    }

    pub fn contracts_build_dir(&self) -> &Path {
        &self.contracts_build_dir
    }

    /// Directory holding one `<name>.json` artifact per deployed contract.
    pub fn contracts_dir(&self) -> PathBuf {
        self.contracts_build_dir.join("contracts")
    }

    pub fn ledger_db_dir(&self) -> &Path {
        &self.ledger_db_dir
    }

    pub fn contracts(&self) -> &[String] {
        &self.contracts
    }

    /// File the service under test writes once it finished its own bootstrap.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn identities(&self) -> &[TestIdentity] {
        &self.identities
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        self.readiness
    }

    pub fn deploy_timeout(&self) -> Duration {
        self.deploy_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn validate(&self) -> Result<()> {
        validate_stores(&self.stores)?;

        if self.broker_url.is_empty() {
            bail!("broker_url cannot be empty");
        }
        if self.exchange.is_empty() {
            bail!("exchange cannot be empty");
        }

        self.ledger_process.validate()?;
        self.deploy_process.validate()?;
        self.service_process.validate()?;
        self.readiness.validate()?;

        if self.contracts.iter().any(|name| name.trim().is_empty()) {
            bail!("contract names cannot be empty");
        }
        if self.deploy_timeout.is_zero() {
            bail!("deploy_timeout must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct HarnessConfigBuilder {
    stores: Vec<StoreSettings>,
    broker_url: Option<String>,
    exchange: Option<String>,
    ledger: Option<LedgerEndpoint>,
    ledger_process: Option<ProcessSpec>,
    deploy_process: Option<ProcessSpec>,
    service_process: Option<ProcessSpec>,
    contracts_build_dir: Option<PathBuf>,
    ledger_db_dir: Option<PathBuf>,
    contracts: Vec<String>,
    artifact_path: Option<PathBuf>,
    identities: Vec<(String, String)>,
    readiness: Option<ReadinessPolicy>,
    readiness_timeout: Option<Duration>,
    deploy_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl HarnessConfigBuilder {
    pub fn store(mut self, name: impl Into<String>, uri: impl Into<String>) -> Self {
        self.stores.push(StoreSettings::new(name, uri));
        self
    }

    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = Some(url.into());
        self
    }

    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchange = Some(name.into());
        self
    }

    pub fn ledger(mut self, endpoint: LedgerEndpoint) -> Self {
        self.ledger = Some(endpoint);
        self
    }

    pub fn ledger_process(mut self, spec: ProcessSpec) -> Self {
        self.ledger_process = Some(spec);
        self
    }

    pub fn deploy_process(mut self, spec: ProcessSpec) -> Self {
        self.deploy_process = Some(spec);
        self
    }

    pub fn service_process(mut self, spec: ProcessSpec) -> Self {
        self.service_process = Some(spec);
        self
    }

    pub fn contracts_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.contracts_build_dir = Some(dir.into());
        self
    }

    pub fn ledger_db_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_db_dir = Some(dir.into());
        self
    }

    pub fn contract(mut self, name: impl Into<String>) -> Self {
        self.contracts.push(name.into());
        self
    }

    pub fn artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    /// Adds a test identity from a hex-encoded 32-byte private key.
    pub fn identity(mut self, name: impl Into<String>, private_key_hex: impl Into<String>) -> Self {
        self.identities.push((name.into(), private_key_hex.into()));
        self
    }

    pub fn readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness = Some(policy);
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    pub fn deploy_timeout(mut self, timeout: Duration) -> Self {
        self.deploy_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HarnessConfig> {
        let contracts_root = PathBuf::from(DEFAULT_CONTRACTS_ROOT);

        let mut readiness = self.readiness.unwrap_or_default();
        if let Some(timeout) = self.readiness_timeout {
            readiness.timeout = timeout;
        }

        let identities = self
            .identities
            .into_iter()
            .map(|(name, key)| {
                TestIdentity::from_hex(&name, &key)
                    .with_context(|| format!("invalid private key for identity {name}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let config = HarnessConfig {
            stores: self.stores,
            broker_url: self
                .broker_url
                .map(|url| url.trim().to_owned())
                .unwrap_or_else(|| DEFAULT_BROKER_URL.to_owned()),
            exchange: self
                .exchange
                .map(|name| name.trim().to_owned())
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_owned()),
            ledger: self
                .ledger
                .unwrap_or_else(|| LedgerEndpoint::Ipc(PathBuf::from(DEFAULT_LEDGER_IPC_PATH))),
            ledger_process: self.ledger_process.unwrap_or_else(default_ledger_process),
            deploy_process: self
                .deploy_process
                .unwrap_or_else(|| default_deploy_process(&contracts_root)),
            service_process: self
                .service_process
                .unwrap_or_else(|| ProcessSpec::new("service", "node").arg("index.js")),
            contracts_build_dir: self
                .contracts_build_dir
                .unwrap_or_else(|| contracts_root.join("build")),
            ledger_db_dir: self
                .ledger_db_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_DB_DIR)),
            contracts: self.contracts,
            artifact_path: self
                .artifact_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_PATH)),
            identities,
            readiness,
            deploy_timeout: self.deploy_timeout.unwrap_or(DEFAULT_DEPLOY_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        };

        config.validate()?;
        Ok(config)
    }
}

fn default_ledger_process() -> ProcessSpec {
    ProcessSpec::new("ledger", "node")
        .args(["--max_old_space_size=4096", "tests/utils/node/ipcConverter.js"])
        .inherit_output(true)
}

fn default_deploy_process(contracts_root: &Path) -> ProcessSpec {
    ProcessSpec::new("contract-deploy", "node")
        .args(["../truffle/build/cli.bundled.js", "migrate"])
        .current_dir(contracts_root)
        .inherit_output(true)
}
