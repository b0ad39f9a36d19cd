use crate::runtime::telemetry::Telemetry;
use crate::store::registry::DisconnectEvent;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why the process (or harness) is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C / SIGINT.
    Signal,
    /// A registered store dropped after startup.
    StoreDisconnected { store: String },
    /// A supervised helper process exited while it was expected to be running.
    ProcessExited { process: String, status: String },
    /// The root token was cancelled by the caller.
    Cancelled,
}

impl ShutdownReason {
    /// Process exit code for this reason.
    ///
    /// A lost store is an intentional shutdown trigger, not a crash, so it maps to 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Signal
            | ShutdownReason::StoreDisconnected { .. }
            | ShutdownReason::Cancelled => 0,
            ShutdownReason::ProcessExited { .. } => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShutdownReason::StoreDisconnected { .. } | ShutdownReason::ProcessExited { .. }
        )
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "interrupt signal received"),
            ShutdownReason::StoreDisconnected { store } => {
                write!(f, "store {store} disconnected")
            }
            ShutdownReason::ProcessExited { process, status } => {
                write!(f, "process {process} exited unexpectedly ({status})")
            }
            ShutdownReason::Cancelled => write!(f, "shutdown requested"),
        }
    }
}

/// Single owner of process-terminating decisions.
///
/// Every fatal condition (store loss, supervised process exit) is funnelled through
/// [`ShutdownCoordinator::trigger`]; only the first trigger is recorded and it cancels the
/// root token every long-running task derives from.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    triggered: AtomicBool,
    root_shutdown: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    notify: Notify,
    telemetry: Arc<Telemetry>,
}

impl ShutdownCoordinator {
    pub fn new(root_shutdown: CancellationToken, telemetry: Arc<Telemetry>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                triggered: AtomicBool::new(false),
                root_shutdown,
                reason: Mutex::new(None),
                notify: Notify::new(),
                telemetry,
            }),
        }
    }

    /// Records `reason` and cancels the root token. Returns `false` if a reason was
    /// already recorded, in which case nothing happens.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason = %reason, "shutdown already triggered; ignoring");
            return false;
        }

        if reason.is_fatal() {
            tracing::error!(reason = %reason, "fatal condition; initiating shutdown");
        } else {
            tracing::info!(reason = %reason, "initiating shutdown");
        }

        if let Ok(mut slot) = self.inner.reason.lock() {
            *slot = Some(reason);
        }

        self.inner.root_shutdown.cancel();
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner
            .reason
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned())
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.root_shutdown.clone()
    }

    /// Resolves once a reason has been recorded or the root token is cancelled elsewhere.
    pub async fn triggered(&self) -> ShutdownReason {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.root_shutdown.cancelled() => {
                    return self.reason().unwrap_or(ShutdownReason::Cancelled);
                }
            }
        }
    }

    /// Consumes registry disconnect events; the first one ends the process lifecycle.
    pub fn spawn_disconnect_listener(
        &self,
        mut events: broadcast::Receiver<DisconnectEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        let shutdown = self.token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            coordinator.inner.telemetry.record_store_disconnect();
                            tracing::error!(store = %event.store, uri = %event.uri, error = %event.error, "store disconnected");
                            coordinator.trigger(ShutdownReason::StoreDisconnected { store: event.store });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "disconnect listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("disconnect listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn coordinator() -> ShutdownCoordinator {
        ShutdownCoordinator::new(CancellationToken::new(), Arc::new(Telemetry::default()))
    }

    #[test]
    fn only_first_trigger_is_recorded() {
        let coordinator = coordinator();
        assert!(coordinator.trigger(ShutdownReason::StoreDisconnected {
            store: "data".into()
        }));
        assert!(!coordinator.trigger(ShutdownReason::Signal));
        assert_eq!(
            coordinator.reason(),
            Some(ShutdownReason::StoreDisconnected {
                store: "data".into()
            })
        );
        assert!(coordinator.token().is_cancelled());
    }

    #[test]
    fn exit_codes_follow_policy() {
        assert_eq!(
            ShutdownReason::StoreDisconnected {
                store: "accounts".into()
            }
            .exit_code(),
            0
        );
        assert_eq!(ShutdownReason::Signal.exit_code(), 0);
        assert_eq!(
            ShutdownReason::ProcessExited {
                process: "ledger".into(),
                status: "exit status: 1".into()
            }
            .exit_code(),
            1
        );
    }

    #[tokio::test]
    async fn triggered_resolves_after_trigger() {
        let coordinator = coordinator();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.triggered().await })
        };
        tokio::task::yield_now().await;
        coordinator.trigger(ShutdownReason::Signal);
        let reason = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .expect("task should not panic");
        assert_eq!(reason, ShutdownReason::Signal);
    }

    #[tokio::test]
    async fn external_cancellation_reports_cancelled() {
        let coordinator = coordinator();
        coordinator.token().cancel();
        let reason = timeout(Duration::from_secs(1), coordinator.triggered())
            .await
            .expect("should resolve");
        assert_eq!(reason, ShutdownReason::Cancelled);
    }

    #[tokio::test]
    async fn disconnect_listener_triggers_once() {
        let telemetry = Arc::new(Telemetry::default());
        let coordinator = ShutdownCoordinator::new(CancellationToken::new(), telemetry.clone());
        let (tx, rx) = broadcast::channel(8);
        let handle = coordinator.spawn_disconnect_listener(rx);

        tx.send(DisconnectEvent {
            store: "data".into(),
            uri: "memory://data".into(),
            error: "ping failed".into(),
        })
        .expect("listener subscribed");

        let reason = timeout(Duration::from_secs(1), coordinator.triggered())
            .await
            .expect("listener should trigger shutdown");
        assert_eq!(
            reason,
            ShutdownReason::StoreDisconnected {
                store: "data".into()
            }
        );
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener stops on shutdown")
            .expect("listener should not panic");
        assert_eq!(telemetry.snapshot().store_disconnects, 1);
    }
}
