use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use crate::{
    broker::{shutdown_requested, BrokerInner},
    log::{DurableLog, LogRecord, TailStream},
    BrokerError, BrokerEvent,
};

/// Pumps one tail cursor into the event bus, reopening it when it fails
pub(crate) struct TailBridge<R: LogRecord> {
    inner: Arc<BrokerInner>,
    log: Arc<dyn DurableLog<R>>,
    filter: R::Filter,
    dispatch: fn(&BrokerInner, R),
}

impl<R: LogRecord> TailBridge<R> {
    pub(crate) fn new(
        inner: Arc<BrokerInner>,
        log: Arc<dyn DurableLog<R>>,
        filter: R::Filter,
        dispatch: fn(&BrokerInner, R),
    ) -> Self {
        Self { inner, log, filter, dispatch }
    }

    /// Run until shutdown or until the tail cannot be reopened
    pub(crate) async fn run(self, initial: TailStream<R>) {
        let mut shutdown = self.inner.shutdown_signal();
        let mut tail = Some(initial);
        let mut failures: u32 = 0;

        loop {
            let error = match tail.take() {
                Some(stream) => tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => return,
                    closed = self.pump(stream, &mut failures) => closed,
                },
                None => {
                    let opened = tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => return,
                        opened = self.log.open_tail(self.filter.clone()) => opened,
                    };
                    match opened {
                        Ok(stream) => {
                            debug!("Reopened tail on {}", self.log.name());
                            tail = Some(stream);
                            continue;
                        }
                        Err(error) => error,
                    }
                }
            };

            failures += 1;
            warn!("Tail on {} failed ({}/{}): {}", self.log.name(), failures, self.inner.config.tail_reopen_attempts, error);
            self.inner.emit(BrokerEvent::error(error.to_string()));

            if failures > self.inner.config.tail_reopen_attempts || !error.is_tail_recoverable() {
                error!("Giving up on tail {} after {} failure(s)", self.log.name(), failures);
                self.inner.emit(BrokerEvent::error(format!(
                    "tail on '{}' stopped after {} failure(s)",
                    self.log.name(),
                    failures
                )));
                return;
            }

            let delay = reopen_delay(
                failures,
                self.inner.config.tail_reopen_backoff,
                self.inner.config.max_tail_reopen_backoff,
            );
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward records until the stream ends or falls behind. Other item errors are reported and skipped.
    async fn pump(&self, mut stream: TailStream<R>, failures: &mut u32) -> BrokerError {
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    *failures = 0;
                    (self.dispatch)(&self.inner, record);
                }
                // Skipped records are only recovered by the replay of a fresh cursor
                Err(error @ BrokerError::TailLagged { .. }) => return error,
                Err(error) => {
                    warn!("Tail on {} reported: {}", self.log.name(), error);
                    self.inner.emit(BrokerEvent::error(error.to_string()));
                }
            }
        }
        BrokerError::TailClosed(self.log.name().to_string())
    }
}

/// Exponential backoff from `base`, capped at `max`, with +/-20% jitter
pub(crate) fn reopen_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(max);

    let millis = delay.as_millis() as u64;
    let span = millis / 5;
    if span == 0 {
        return delay;
    }
    let jittered = rand::thread_rng().gen_range(millis - span..=millis + span);
    Duration::from_millis(jittered).min(max)
}
