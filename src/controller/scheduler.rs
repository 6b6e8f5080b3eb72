//! Informer driven scheduler
//!
//! Every controller gets one worker task. A worker syncs once at start, then again
//! whenever one of the caches it watches changes, its resync interval elapses, or
//! a failed sync is due for a retry. Syncs of one controller never overlap.
//!
//! A failing sync is reported as `<Controller>Degraded=True` on the singleton, a
//! successful one clears it. Panics are caught at the worker boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::conditions::{degraded_condition, not_degraded_condition};
use super::informers::InformerKind;
use super::operator_client::OperatorClient;
use super::Controller;
use crate::crd::Condition;
use crate::error::{Error, Result};

/// Default interval between unconditional syncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Retry delay for configuration errors that will not fix themselves quickly
const NON_RETRIABLE_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff for retriable failures.
///
/// # Arguments
/// * `attempt` - Number of consecutive failures so far (0-based)
/// * `base_delay_secs` - Delay for the first retry, 15 seconds when `None`
/// * `max_delay_secs` - Upper bound, 300 seconds when `None`
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    // Exponential: base * 2^attempt, capped at max
    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

/// Delay before the next sync after a failure
pub fn retry_delay(error: &Error, attempt: u32) -> Duration {
    if error.is_retriable() {
        calculate_backoff(attempt, None, None)
    } else {
        NON_RETRIABLE_DELAY
    }
}

/// Where workers report the outcome of their syncs
#[async_trait]
pub trait ConditionSink: Send + Sync {
    async fn publish(&self, conditions: Vec<Condition>) -> Result<()>;
}

#[async_trait]
impl ConditionSink for OperatorClient {
    async fn publish(&self, conditions: Vec<Condition>) -> Result<()> {
        self.update_conditions(conditions).await.map(|_| ())
    }
}

/// Result of one sync as seen by the worker
#[derive(Debug)]
enum SyncOutcome {
    Succeeded,
    Failed(Error),
    Panicked,
    Cancelled,
}

pub struct Scheduler {
    controllers: Vec<Arc<dyn Controller>>,
    events: broadcast::Sender<InformerKind>,
    sink: Arc<dyn ConditionSink>,
    resync_interval: Duration,
}

impl Scheduler {
    pub fn new(
        controllers: Vec<Arc<dyn Controller>>,
        events: broadcast::Sender<InformerKind>,
        sink: Arc<dyn ConditionSink>,
    ) -> Self {
        Self {
            controllers,
            events,
            sink,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Run every worker until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut workers = JoinSet::new();
        for controller in self.controllers {
            let worker = Worker {
                name: controller.name().to_string(),
                controller,
                events: self.events.subscribe(),
                sink: self.sink.clone(),
                resync_interval: self.resync_interval,
            };
            workers.spawn(worker.run(token.clone()));
        }
        info!(controllers = workers.len(), "Scheduler started");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Controller worker stopped unexpectedly: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

struct Worker {
    name: String,
    controller: Arc<dyn Controller>,
    events: broadcast::Receiver<InformerKind>,
    sink: Arc<dyn ConditionSink>,
    resync_interval: Duration,
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        let mut attempt = 0u32;
        let mut next_sync = Instant::now();
        let mut listening = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(next_sync) => {}
                event = self.events.recv(), if listening => match event {
                    Ok(kind) if self.controller.watches().contains(&kind) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(controller = %self.name, skipped, "Event receiver lagged");
                    }
                    Err(RecvError::Closed) => {
                        listening = false;
                        continue;
                    }
                },
            }
            self.drain_pending();

            match self.sync_once(&token).await {
                SyncOutcome::Succeeded => {
                    attempt = 0;
                    next_sync = Instant::now() + self.resync_interval;
                }
                SyncOutcome::Failed(e) => {
                    next_sync = Instant::now() + retry_delay(&e, attempt);
                    attempt = attempt.saturating_add(1);
                }
                SyncOutcome::Panicked => {
                    next_sync = Instant::now() + calculate_backoff(attempt, None, None);
                    attempt = attempt.saturating_add(1);
                }
                SyncOutcome::Cancelled => break,
            }
        }
        debug!(controller = %self.name, "Worker stopped");
    }

    /// Events queued during a sync are covered by the next one
    fn drain_pending(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn sync_once(&self, token: &CancellationToken) -> SyncOutcome {
        let started = std::time::Instant::now();
        let controller = self.controller.clone();
        let child = token.clone();
        let joined = tokio::spawn(async move { controller.sync(&child).await }).await;

        #[cfg(feature = "metrics")]
        super::metrics::observe_sync_duration_seconds(&self.name, started.elapsed().as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        match joined {
            Ok(Ok(())) => {
                self.report(None).await;
                SyncOutcome::Succeeded
            }
            Ok(Err(Error::Cancelled)) => SyncOutcome::Cancelled,
            Ok(Err(e)) => {
                warn!(controller = %self.name, "Sync failed: {}", e);
                #[cfg(feature = "metrics")]
                super::metrics::inc_sync_error(&self.name, &e);
                self.report(Some(e.to_string())).await;
                SyncOutcome::Failed(e)
            }
            Err(e) if e.is_panic() => {
                error!(controller = %self.name, "Sync panicked");
                #[cfg(feature = "metrics")]
                super::metrics::inc_panic(&self.name);
                self.report(Some("sync panicked".to_string())).await;
                SyncOutcome::Panicked
            }
            Err(_) => SyncOutcome::Cancelled,
        }
    }

    /// Publish the degraded condition; failures here are only logged
    async fn report(&self, failure: Option<String>) {
        let condition = match &failure {
            Some(message) => degraded_condition(&self.name, message),
            None => not_degraded_condition(&self.name),
        };
        if let Err(e) = self.sink.publish(vec![condition]).await {
            warn!(controller = %self.name, "Failed to report sync result: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(60));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(40, None, None), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_custom_bounds() {
        assert_eq!(calculate_backoff(0, Some(1), Some(10)), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3, Some(1), Some(10)), Duration::from_secs(8));
        assert_eq!(calculate_backoff(4, Some(1), Some(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_configuration_errors_retry_slowly() {
        let config = Error::ConfigError("bad semver".to_string());
        assert_eq!(retry_delay(&config, 0), NON_RETRIABLE_DELAY);
        assert_eq!(retry_delay(&config, 7), NON_RETRIABLE_DELAY);

        let io = Error::io("/tmp/x", std::io::Error::other("gone"));
        assert_eq!(retry_delay(&io, 0), Duration::from_secs(15));
        assert_eq!(retry_delay(&io, 1), Duration::from_secs(30));
    }
}
