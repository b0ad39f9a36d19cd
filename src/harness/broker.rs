//! Message-broker seam: connection, channel and exchange declaration.
//!
//! Only the topology the harness needs is modelled. [`MemoryBroker`] implements the
//! seam in-process for development runs and tests.

use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
}

pub trait BrokerConnector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Arc<dyn BrokerConnection>>>;
}

pub trait BrokerConnection: Send + Sync {
    fn create_channel(&self) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

pub trait BrokerChannel: Send + Sync {
    /// Declares `name`, or checks that an existing exchange matches `kind` and `options`.
    fn assert_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BoxFuture<'a, Result<()>>;

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, (ExchangeKind, ExchangeOptions)>,
    published: Vec<PublishedMessage>,
}

#[derive(Debug, Default)]
struct BrokerShared {
    state: Arc<Mutex<BrokerState>>,
    refuse_connections: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-process broker. Clones share exchanges, published messages and counters.
#[derive(Debug, Default, Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `connect` calls fail, as if the broker were down.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn exchange(&self, name: &str) -> Option<(ExchangeKind, ExchangeOptions)> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.exchanges.get(name).copied())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared
            .state
            .lock()
            .map(|state| state.published.clone())
            .unwrap_or_default()
    }
}

impl BrokerConnector for MemoryBroker {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Arc<dyn BrokerConnection>>> {
        Box::pin(async move {
            if self.shared.refuse_connections.load(Ordering::SeqCst) {
                bail!("broker at {url} refused the connection");
            }
            self.shared.opened.fetch_add(1, Ordering::SeqCst);
            let connection: Arc<dyn BrokerConnection> = Arc::new(MemoryConnection {
                broker: self.shared.clone(),
                closed: Arc::new(AtomicBool::new(false)),
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    broker: Arc<BrokerShared>,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection for MemoryConnection {
    fn create_channel(&self) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                bail!("broker connection is closed");
            }
            let channel: Arc<dyn BrokerChannel> = Arc::new(MemoryChannel {
                state: self.broker.state.clone(),
                closed: self.closed.clone(),
            });
            Ok(channel)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                bail!("broker connection already closed");
            }
            self.broker.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("broker channel is closed");
        }
        Ok(())
    }
}

impl BrokerChannel for MemoryChannel {
    fn assert_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("broker state poisoned"))?;
            match state.exchanges.get(name).copied() {
                Some((existing_kind, existing_options)) => {
                    if (existing_kind, existing_options) != (kind, options) {
                        bail!(
                            "exchange {name} already declared as {existing_kind} (durable: {})",
                            existing_options.durable
                        );
                    }
                }
                None => {
                    state.exchanges.insert(name.to_owned(), (kind, options));
                }
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("broker state poisoned"))?;
            if !state.exchanges.contains_key(exchange) {
                bail!("exchange {exchange} is not declared");
            }
            state.published.push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
            });
            Ok(())
        })
    }
}
