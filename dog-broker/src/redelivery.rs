use std::sync::Arc;
use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    broker::{shutdown_requested, BrokerInner},
    BrokerEvent, BrokerResult, JobFilter,
};

/// Periodically re-surfaces failed and abandoned jobs on their namespace topics.
///
/// Tails only carry inserts, so a job whose status changed after insertion
/// would otherwise never be seen again.
pub(crate) struct RedeliverySweep {
    inner: Arc<BrokerInner>,
}

impl RedeliverySweep {
    pub(crate) fn new(inner: Arc<BrokerInner>) -> Self {
        Self { inner }
    }

    /// Sweep every `redelivery_interval` until shutdown
    pub(crate) async fn run(self) {
        let period = self.inner.config.redelivery_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.inner.shutdown_signal();

        info!("Starting redelivery sweep with interval: {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            match self.sweep_once().await {
                Ok(redelivered) if redelivered > 0 => info!("Redelivered {} job(s)", redelivered),
                Ok(_) => debug!("No jobs to redeliver"),
                Err(e) => {
                    warn!("Error during redelivery sweep: {}", e);
                    self.inner.emit(BrokerEvent::error(format!("redelivery sweep: {}", e)));
                }
            }
        }

        debug!("Redelivery sweep stopped");
    }

    /// Run one sweep. Returns how many jobs were redelivered.
    pub(crate) async fn sweep_once(&self) -> BrokerResult<usize> {
        let config = &self.inner.config;
        let filter = JobFilter::Redeliverable {
            timeout: config.retry_timeout,
            max_attempts: config.max_attempts,
        };

        let due = self.inner.jobs.find(&filter).await?;
        let redelivered = due.len();

        for record in due {
            let listeners = self.inner.bus.emit_namespace(&record);
            if config.debug {
                debug!(
                    "Redelivering job {} ({}, attempt {}) to {} listener(s)",
                    record.job_ref, record.status, record.attempts, listeners
                );
            }
            self.inner.emit(BrokerEvent::Redelivered {
                job_ref: record.job_ref,
                namespace: record.namespace,
                attempts: record.attempts,
                at: Utc::now(),
            });
        }

        Ok(redelivered)
    }
}
