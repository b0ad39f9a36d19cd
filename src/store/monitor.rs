//! Per-connection health monitor that turns a lost store into a disconnect event.

use crate::store::connection::Connection;
use crate::store::registry::DisconnectEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct HealthMonitor {
    pub connection: Arc<Connection>,
    pub check_interval: Duration,
    pub ping_timeout: Duration,
    pub shutdown: CancellationToken,
    pub closing: Arc<AtomicBool>,
    pub events: broadcast::Sender<DisconnectEvent>,
}

impl HealthMonitor {
    /// Pings until the first failure, emits one event for it, and stops. There is no
    /// reconnect path: a store lost after startup ends the process.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let HealthMonitor {
            connection,
            check_interval,
            ping_timeout,
            shutdown,
            closing,
            events,
        } = self;

        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let store = connection.store();
                        let error = match timeout(ping_timeout, store.ping()).await {
                            Ok(Ok(())) => continue,
                            Ok(Err(err)) => format!("{err:#}"),
                            Err(_) => format!("ping timed out after {ping_timeout:?}"),
                        };

                        if closing.load(Ordering::SeqCst) || connection.is_closed() {
                            break;
                        }

                        if connection.mark_disconnected() {
                            tracing::warn!(
                                store = connection.name(),
                                error = %error,
                                "store health check failed"
                            );
                            let event = DisconnectEvent {
                                store: connection.name().to_owned(),
                                uri: connection.uri().to_owned(),
                                error,
                            };
                            if events.send(event).is_err() {
                                tracing::error!(
                                    store = connection.name(),
                                    "store disconnected but nobody is listening for disconnect events"
                                );
                            }
                        }
                        break;
                    }
                }
            }

            tracing::debug!(store = connection.name(), "store health monitor stopped");
        })
    }
}
