//! Active readiness probes polled with exponential backoff and a bounded deadline.

use crate::harness::config::{LedgerEndpoint, ReadinessPolicy};
use crate::harness::process::{ManagedProcess, ProcessError};
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::future::BoxFuture;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub trait ReadinessProbe: Send + Sync {
    fn describe(&self) -> String;

    /// One attempt; `Ok` means the dependency is ready.
    fn probe(&self) -> BoxFuture<'_, Result<()>>;
}

/// Ready once `eth_blockNumber` answers over HTTP.
pub struct JsonRpcProbe {
    url: String,
    client: HttpClient,
}

impl JsonRpcProbe {
    pub fn new(url: &str, user: Option<&str>, password: Option<&str>) -> Result<Self> {
        Ok(Self {
            url: url.to_owned(),
            client: build_http_client(url, user, password, PROBE_REQUEST_TIMEOUT)?,
        })
    }
}

impl ReadinessProbe for JsonRpcProbe {
    fn describe(&self) -> String {
        format!("json-rpc {}", self.url)
    }

    fn probe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let block: String = self
                .client
                .request("eth_blockNumber", rpc_params![])
                .await
                .context("eth_blockNumber failed")?;
            tracing::debug!(url = %self.url, block = %block, "ledger answered");
            Ok(())
        })
    }
}

/// Ready once the IPC socket accepts a connection.
pub struct SocketProbe {
    path: PathBuf,
}

impl SocketProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReadinessProbe for SocketProbe {
    fn describe(&self) -> String {
        format!("ipc socket {}", self.path.display())
    }

    fn probe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(connect_socket(&self.path))
    }
}

#[cfg(unix)]
async fn connect_socket(path: &Path) -> Result<()> {
    tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| format!("cannot connect to {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
async fn connect_socket(path: &Path) -> Result<()> {
    bail!("ipc socket {} requires a unix platform", path.display())
}

/// Ready once a file exists.
pub struct FileProbe {
    path: PathBuf,
}

impl FileProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReadinessProbe for FileProbe {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn probe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match tokio::fs::metadata(&self.path).await {
                Ok(metadata) if metadata.is_file() => Ok(()),
                Ok(_) => bail!("{} is not a file", self.path.display()),
                Err(err) => Err(err).with_context(|| format!("{} missing", self.path.display())),
            }
        })
    }
}

/// Probe matching the ledger transport.
pub fn ledger_probe(endpoint: &LedgerEndpoint) -> Result<Box<dyn ReadinessProbe>> {
    Ok(match endpoint {
        LedgerEndpoint::Http {
            url,
            user,
            password,
        } => Box::new(JsonRpcProbe::new(
            url,
            user.as_deref(),
            password.as_deref(),
        )?),
        LedgerEndpoint::Ipc(path) => Box::new(SocketProbe::new(path.clone())),
    })
}

/// Polls `probe` until it succeeds, `process` exits, the policy deadline elapses or
/// `cancellation` fires. Marks the process ready on success.
pub async fn wait_until_ready(
    process: &ManagedProcess,
    probe: &dyn ReadinessProbe,
    policy: ReadinessPolicy,
    cancellation: &CancellationToken,
) -> Result<(), ProcessError> {
    let backoff = RetryBackoff::new(policy.initial_delay, policy.max_delay)
        .with_timeout(policy.timeout)
        .with_cancellation(cancellation);

    let outcome = retry_with_backoff(
        backoff,
        move |_attempt| async move {
            if let Some(exit) = process.exit() {
                return Err(ProcessError::ExitedEarly {
                    process: process.name().to_owned(),
                    status: exit.describe(),
                }
                .into());
            }
            probe.probe().await
        },
        |attempt, delay, err| {
            tracing::debug!(
                process = %process.name(),
                probe = %probe.describe(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "dependency not ready yet"
            );
        },
        |_, err| {
            if err.downcast_ref::<ProcessError>().is_some() {
                RetryDisposition::Abort
            } else {
                RetryDisposition::Retry
            }
        },
    )
    .await;

    match outcome {
        Ok(()) => {
            process.mark_ready();
            tracing::info!(process = %process.name(), probe = %probe.describe(), "dependency ready");
            Ok(())
        }
        Err(err) => Err(match err.downcast::<ProcessError>() {
            Ok(process_err) => process_err,
            Err(source) => ProcessError::NotReady {
                process: process.name().to_owned(),
                source,
            },
        }),
    }
}

pub(crate) fn build_http_client(
    url: &str,
    user: Option<&str>,
    password: Option<&str>,
    request_timeout: Duration,
) -> Result<HttpClient> {
    let mut builder = HttpClientBuilder::default().request_timeout(request_timeout);
    if let Some(user) = user {
        builder = builder.set_headers(basic_auth_headers(user, password.unwrap_or_default())?);
    }
    builder
        .build(url)
        .map_err(|err| anyhow!("failed to construct ledger RPC client: {err}"))
}

fn basic_auth_headers(user: &str, password: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
    let value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .context("failed to build Authorization header")?;
    headers.insert("Authorization", value);
    Ok(headers)
}
