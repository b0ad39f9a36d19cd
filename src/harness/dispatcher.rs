//! Runs registered suites against the shared context, in declaration order.

use crate::harness::context::SharedContext;
use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

type SuiteFn = Arc<dyn Fn(Arc<SharedContext>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteOutcome {
    Passed,
    Failed(String),
    /// Not run because the harness was shutting down.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteResult {
    pub name: String,
    pub outcome: SuiteOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub results: Vec<SuiteResult>,
}

impl DispatchReport {
    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, SuiteOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, SuiteOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, SuiteOutcome::Skipped))
    }

    pub fn all_passed(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.outcome == SuiteOutcome::Passed)
    }

    pub fn outcome(&self, suite: &str) -> Option<&SuiteOutcome> {
        self.results
            .iter()
            .find(|result| result.name == suite)
            .map(|result| &result.outcome)
    }

    fn count(&self, predicate: impl Fn(&SuiteOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

#[derive(Default)]
pub struct SuiteDispatcher {
    suites: Vec<(String, SuiteFn)>,
}

impl SuiteDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, suite: F) -> &mut Self
    where
        F: Fn(Arc<SharedContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let suite: SuiteFn = Arc::new(move |context| -> BoxFuture<'static, Result<()>> {
            Box::pin(suite(context))
        });
        self.suites.push((name.into(), suite));
        self
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    /// Runs every suite in its own task so a failing or panicking suite cannot stop
    /// the next one. Once `shutdown` fires, the running suite is aborted and the rest
    /// are reported as skipped.
    pub async fn dispatch(
        &self,
        context: Arc<SharedContext>,
        shutdown: &CancellationToken,
    ) -> DispatchReport {
        let telemetry = context.telemetry().clone();
        let mut report = DispatchReport::default();

        for (name, suite) in &self.suites {
            let started = Instant::now();
            let outcome = if shutdown.is_cancelled() {
                SuiteOutcome::Skipped
            } else {
                tracing::info!(suite = %name, "running suite");
                let mut handle = tokio::spawn(suite(context.clone()));
                tokio::select! {
                    joined = &mut handle => match joined {
                        Ok(Ok(())) => SuiteOutcome::Passed,
                        Ok(Err(err)) => SuiteOutcome::Failed(format!("{err:#}")),
                        Err(err) if err.is_panic() => SuiteOutcome::Failed("suite panicked".to_owned()),
                        Err(err) => SuiteOutcome::Failed(err.to_string()),
                    },
                    _ = shutdown.cancelled() => {
                        handle.abort();
                        SuiteOutcome::Failed("harness shut down while the suite was running".to_owned())
                    }
                }
            };

            match &outcome {
                SuiteOutcome::Passed => {
                    telemetry.record_suite_passed();
                    tracing::info!(suite = %name, "suite passed");
                }
                SuiteOutcome::Failed(reason) => {
                    telemetry.record_suite_failed();
                    tracing::error!(suite = %name, reason = %reason, "suite failed");
                }
                SuiteOutcome::Skipped => {
                    telemetry.record_suite_skipped();
                    tracing::warn!(suite = %name, "suite skipped");
                }
            }

            report.results.push(SuiteResult {
                name: name.clone(),
                outcome,
                elapsed: started.elapsed(),
            });
        }

        tracing::info!(summary = %report, "suite dispatch finished");
        report
    }
}
