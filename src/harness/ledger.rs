//! Minimal ledger client handed to suites: JSON-RPC over HTTP or over an IPC socket.
//!
//! IPC endpoints are unix domain sockets and are only available on unix targets.

use crate::harness::config::LedgerEndpoint;
use crate::harness::readiness::build_http_client;
use anyhow::{bail, Context, Result};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::HttpClient;
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

enum Transport {
    Http(HttpClient),
    #[cfg(unix)]
    Ipc(ipc::IpcStream),
}

pub struct LedgerClient {
    endpoint: LedgerEndpoint,
    transport: Transport,
    request_timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LedgerClient {
    /// Connects to `endpoint`. IPC endpoints open their socket here; HTTP clients
    /// connect lazily per request.
    pub async fn connect(endpoint: LedgerEndpoint, request_timeout: Duration) -> Result<Self> {
        let transport = match &endpoint {
            LedgerEndpoint::Http {
                url,
                user,
                password,
            } => Transport::Http(build_http_client(
                url,
                user.as_deref(),
                password.as_deref(),
                request_timeout,
            )?),
            #[cfg(unix)]
            LedgerEndpoint::Ipc(path) => {
                Transport::Ipc(ipc::IpcStream::connect(path, request_timeout).await?)
            }
            #[cfg(not(unix))]
            LedgerEndpoint::Ipc(path) => {
                bail!("ipc endpoint {} requires a unix platform", path.display())
            }
        };

        Ok(Self {
            endpoint,
            transport,
            request_timeout,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &LedgerEndpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self.request("eth_blockNumber", Vec::new()).await?;
        parse_quantity(&hex)
    }

    pub async fn request<T>(&self, method: &str, params: Vec<Value>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.is_closed() {
            bail!("ledger client is closed");
        }

        match &self.transport {
            Transport::Http(client) => {
                let mut builder = rpc_params![];
                for param in params {
                    builder
                        .insert(param)
                        .context("failed to encode ledger rpc params")?;
                }
                client
                    .request(method, builder)
                    .await
                    .with_context(|| format!("ledger rpc {method} failed"))
            }
            #[cfg(unix)]
            Transport::Ipc(stream) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let response = stream
                    .call(id, method, params, self.request_timeout)
                    .await?;
                decode_response(response)
            }
        }
    }

    /// Releases the transport. Only the first call does anything; it returns `true`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        #[cfg(unix)]
        {
            if let Transport::Ipc(stream) = &self.transport {
                stream.shutdown().await;
            }
        }
        tracing::info!(endpoint = ?self.endpoint, "ledger client closed");
        true
    }
}

#[cfg(unix)]
mod ipc {
    use anyhow::{anyhow, bail, Context, Result};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    /// Newline-delimited JSON-RPC over a unix socket, one request in flight at a time.
    pub(super) struct IpcStream(Mutex<Option<BufReader<UnixStream>>>);

    impl IpcStream {
        pub(super) async fn connect(path: &Path, connect_timeout: Duration) -> Result<Self> {
            let stream = timeout(connect_timeout, UnixStream::connect(path))
                .await
                .map_err(|_| anyhow!("timed out connecting to {}", path.display()))?
                .with_context(|| format!("failed to connect to {}", path.display()))?;
            Ok(Self(Mutex::new(Some(BufReader::new(stream)))))
        }

        pub(super) async fn call(
            &self,
            id: u64,
            method: &str,
            params: Vec<Value>,
            request_timeout: Duration,
        ) -> Result<Value> {
            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            });

            let mut guard = self.0.lock().await;
            let stream = guard.as_mut().context("ledger client is closed")?;
            timeout(request_timeout, round_trip(stream, id, &request))
                .await
                .map_err(|_| anyhow!("ledger rpc {method} timed out"))?
                .with_context(|| format!("ledger rpc {method} failed"))
        }

        pub(super) async fn shutdown(&self) {
            if let Some(mut reader) = self.0.lock().await.take() {
                if let Err(err) = reader.get_mut().shutdown().await {
                    tracing::debug!(error = %err, "ledger socket shutdown failed");
                }
            }
        }
    }

    /// Sends `request` and reads until the response carrying `id`. Replies to earlier
    /// requests that timed out are still queued on the socket and are discarded.
    async fn round_trip(
        stream: &mut BufReader<UnixStream>,
        id: u64,
        request: &Value,
    ) -> Result<Value> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        stream.get_mut().write_all(&payload).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                bail!("ledger closed the ipc socket");
            }
            let response: Value =
                serde_json::from_str(&line).context("invalid json-rpc response")?;
            match response.get("id").and_then(Value::as_u64) {
                Some(answered) if answered == id => return Ok(response),
                answered => {
                    tracing::debug!(expected = id, ?answered, "discarding stale ledger reply");
                }
            }
        }
    }
}

fn decode_response<T: DeserializeOwned>(mut response: Value) -> Result<T> {
    if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
        bail!("ledger returned error: {error}");
    }
    let result = response
        .get_mut("result")
        .map(Value::take)
        .context("json-rpc response has no result")?;
    serde_json::from_value(result).context("unexpected json-rpc result type")
}

/// Parses an Ethereum hex quantity (`0x1a`).
pub fn parse_quantity(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .with_context(|| format!("quantity {value} is missing the 0x prefix"))?;
    if digits.is_empty() {
        bail!("quantity {value} has no digits");
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid quantity {value}"))
}
