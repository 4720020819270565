use std::future::Future;
use std::sync::{Arc, Weak};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::{
    bridge::TailBridge,
    bus::{EventBus, ListenerId, NamespaceListener},
    config::BrokerConfig,
    log::{ensure_not_empty, BoxStream, DurableLog, LogSource},
    redelivery::RedeliverySweep,
    types::record::validate_namespace,
    BrokerError, BrokerEvent, BrokerResult, Completion, CompletionFilter, CompletionRecord,
    JobFilter, JobRecord, JobRef, JobTransition, LogCapabilities,
};

/// Producer callback, invoked at most once with the job's completion or the publish failure
pub type CompletionCallback = Box<dyn FnOnce(BrokerResult<Completion>) + Send + 'static>;

type CallbackSlot = Arc<Mutex<Option<CompletionCallback>>>;

/// Returned by [`Broker::publish`] before the job is persisted
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_ref: JobRef,
    pub namespace: String,
    /// The record as it will be inserted
    pub record: JobRecord,
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) jobs: Arc<dyn DurableLog<JobRecord>>,
    pub(crate) completions: Arc<dyn DurableLog<CompletionRecord>>,
    pub(crate) bus: EventBus,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerInner {
    pub(crate) fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Resolves once shutdown has been requested or the broker is gone
pub(crate) async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Job broker over a pair of durable tailable logs.
///
/// Producers [`publish`](Broker::publish) opaque payloads under a namespace,
/// consumers [`subscribe`](Broker::subscribe) handlers to namespaces, and a
/// completion reported through [`Done`] is routed back to the producer by the
/// job's ref. Delivery is at-least-once: a job whose handler never completes
/// is redelivered once `retry_timeout` has elapsed, so handlers must be
/// idempotent. There is no exclusive claim; every subscriber of a namespace
/// receives every delivered job.
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Resolve both logs from `source`, prepare them and start the tail bridges and the redelivery sweep
    #[instrument(skip(source, config), fields(jobs = %config.job_collection, completions = %config.completion_collection))]
    pub async fn start<S>(source: &S, config: BrokerConfig) -> BrokerResult<Self>
    where
        S: LogSource + ?Sized,
    {
        config.validate()?;

        let jobs = source.job_log(&config.job_collection)?;
        let completions = source.completion_log(&config.completion_collection)?;
        check_capabilities(jobs.name(), &jobs.capabilities())?;
        check_capabilities(completions.name(), &completions.capabilities())?;

        if ensure_not_empty::<JobRecord, _>(jobs.as_ref()).await? {
            debug!("Inserted placeholder into job log {}", jobs.name());
        }
        if ensure_not_empty::<CompletionRecord, _>(completions.as_ref()).await? {
            debug!("Inserted placeholder into completion log {}", completions.name());
        }

        let job_filter = JobFilter::Actionable { timeout: config.retry_timeout };
        let job_tail = jobs.open_tail(job_filter.clone()).await?;
        let completion_tail = completions.open_tail(CompletionFilter::All).await?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(BrokerInner {
            config,
            jobs: jobs.clone(),
            completions: completions.clone(),
            bus: EventBus::new(),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let job_bridge = TailBridge::new(inner.clone(), jobs, job_filter, deliver_job);
        let completion_bridge =
            TailBridge::new(inner.clone(), completions, CompletionFilter::All, deliver_completion);
        let sweep = RedeliverySweep::new(inner.clone());

        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn(job_bridge.run(job_tail)));
            tasks.push(tokio::spawn(completion_bridge.run(completion_tail)));
            tasks.push(tokio::spawn(sweep.run()));
        }

        info!(
            "Broker started (retry timeout {:?}, redelivery every {:?})",
            inner.config.retry_timeout, inner.config.redelivery_interval
        );

        Ok(Self { inner })
    }

    /// Publish a job onto `namespace`.
    ///
    /// Returns as soon as the record is built; the insert runs on a spawned
    /// task, so this must be called from within a Tokio runtime. When
    /// `on_complete` is given it receives the job's completion, or the
    /// insert error if the job could not be persisted.
    #[instrument(skip(self, payload, on_complete))]
    pub fn publish(
        &self,
        namespace: &str,
        payload: Value,
        on_complete: Option<CompletionCallback>,
    ) -> BrokerResult<JobHandle> {
        let record = JobRecord::new(namespace, payload)?;
        let job_ref = record.job_ref.clone();

        // Armed before the insert so a fast completion cannot beat the registration
        let armed = on_complete.map(|callback| {
            let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));
            let waiter_slot = slot.clone();
            let id = self.inner.bus.once_ref(
                job_ref.clone(),
                Box::new(move |completion: &CompletionRecord| {
                    if let Some(callback) = waiter_slot.lock().take() {
                        callback(Ok(Completion::from(completion.clone())));
                    }
                }),
            );
            (id, slot)
        });

        let handle = JobHandle {
            job_ref: job_ref.clone(),
            namespace: record.namespace.clone(),
            record: record.clone(),
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.jobs.insert(record).await {
                Ok(record) => {
                    if inner.config.debug {
                        debug!("Published job {} to {}", record.job_ref, record.namespace);
                    }
                    inner.emit(BrokerEvent::Published {
                        job_ref: record.job_ref,
                        namespace: record.namespace,
                        at: Utc::now(),
                    });
                }
                Err(error) => fail_publish(&inner, &job_ref, armed, error),
            }
        });

        Ok(handle)
    }

    /// Publish and wait for the job's completion
    pub async fn request(&self, namespace: &str, payload: Value) -> BrokerResult<Completion> {
        let (tx, rx) = oneshot::channel();
        self.publish(
            namespace,
            payload,
            Some(Box::new(move |result: BrokerResult<Completion>| {
                let _ = tx.send(result);
            })),
        )?;

        rx.await.map_err(|_| BrokerError::Shutdown)?
    }

    /// Register `handler` for every job delivered on `namespace`.
    ///
    /// Before the handler runs the stored job is marked `started`. If that
    /// fails the handler is skipped and an error event is emitted; a job
    /// already completed by another subscriber is skipped silently. The
    /// handler receives the job payload and a [`Done`] to report the outcome.
    pub fn subscribe<F, Fut>(&self, namespace: &str, handler: F) -> BrokerResult<&Self>
    where
        F: Fn(Value, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listen(namespace, handler)?;
        Ok(self)
    }

    /// Like [`subscribe`](Broker::subscribe), returning the listener id
    pub fn listen<F, Fut>(&self, namespace: &str, handler: F) -> BrokerResult<ListenerId>
    where
        F: Fn(Value, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_namespace(namespace)?;

        let handler = Arc::new(handler);
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        let listener: NamespaceListener = Arc::new(move |record: &JobRecord| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handler = handler.clone();
            let record = record.clone();
            tokio::spawn(async move {
                if let Some(done) = claim(inner, record).await {
                    let payload = done.record.contents.clone();
                    handler(payload, done).await;
                }
            });
        });

        let id = self.inner.bus.on_namespace(namespace, listener);
        if self.inner.config.debug {
            debug!("Subscribed to {}", namespace);
        }
        Ok(id)
    }

    /// Remove every handler on `namespace`. Returns how many were removed.
    pub fn unsubscribe(&self, namespace: &str) -> usize {
        self.inner.bus.remove_namespace(namespace)
    }

    /// Remove a single handler registered with [`listen`](Broker::listen)
    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.inner.bus.off_namespace(id)
    }

    /// Live stream of broker events from this point on
    pub fn events(&self) -> BoxStream<BrokerEvent> {
        let receiver = self.inner.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|event| event.ok()))
    }

    /// Run one redelivery pass now. Returns how many jobs were redelivered.
    pub async fn sweep_once(&self) -> BrokerResult<usize> {
        RedeliverySweep::new(self.inner.clone()).sweep_once().await
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Stop the tail bridges and the redelivery sweep. In-flight handlers keep running.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.await
                .map_err(|e| BrokerError::Internal(format!("Broker task join error: {}", e)))?;
        }

        info!("Broker stopped");
        Ok(())
    }
}

fn check_capabilities(log: &str, capabilities: &LogCapabilities) -> BrokerResult<()> {
    let missing = capabilities.missing_for_broker();
    if missing.is_empty() {
        return Ok(());
    }
    Err(BrokerError::BackendUnsupported {
        log: log.to_string(),
        feature: missing.join(", "),
    })
}

fn fail_publish(
    inner: &BrokerInner,
    job_ref: &JobRef,
    armed: Option<(ListenerId, CallbackSlot)>,
    error: BrokerError,
) {
    let callback = armed.and_then(|(id, slot)| {
        inner.bus.take_ref(job_ref, id);
        let callback = slot.lock().take();
        callback
    });

    match callback {
        Some(callback) => callback(Err(error)),
        None => debug!("Failed to publish job {}: {}", job_ref, error),
    }
}

fn deliver_job(inner: &BrokerInner, record: JobRecord) {
    if record.is_placeholder() {
        return;
    }

    let listeners = inner.bus.emit_namespace(&record);
    if inner.config.debug {
        debug!("Delivered job {} to {} listener(s) on {}", record.job_ref, listeners, record.namespace);
    }
    inner.emit(BrokerEvent::Delivered {
        job_ref: record.job_ref,
        namespace: record.namespace,
        listeners,
        at: Utc::now(),
    });
}

fn deliver_completion(inner: &BrokerInner, record: CompletionRecord) {
    if record.is_placeholder() {
        return;
    }

    let fired = inner.bus.emit_ref(&record);
    if inner.config.debug && fired > 0 {
        debug!("Completion for {} reached {} waiter(s)", record.job_ref, fired);
    }
}

/// Mark a delivered job `started` in the log. The stored record decides whether the run goes ahead.
async fn claim(inner: Arc<BrokerInner>, delivered: JobRecord) -> Option<Done> {
    let transition = JobTransition::Start { at: Utc::now() };
    let record = match inner.jobs.transition(delivered.job_ref.as_str(), transition).await {
        Ok(record) => record,
        Err(BrokerError::InvalidTransition { from, .. }) => {
            // Another subscriber already resolved this delivery
            debug!("Skipping job {}: already {}", delivered.job_ref, from);
            return None;
        }
        Err(error) => {
            warn!("Could not start job {}: {}", delivered.job_ref, error);
            inner.emit(BrokerEvent::error(format!("start {}: {}", delivered.job_ref, error)));
            return None;
        }
    };

    if inner.config.debug {
        debug!("Started job {} (attempt {})", record.job_ref, record.attempts);
    }
    inner.emit(BrokerEvent::Started {
        job_ref: record.job_ref.clone(),
        attempts: record.attempts,
        at: Utc::now(),
    });

    Some(Done { inner, record })
}

/// Completion handle given to a subscriber. Consuming it reports the outcome exactly once.
pub struct Done {
    inner: Arc<BrokerInner>,
    record: JobRecord,
}

impl Done {
    pub fn job_ref(&self) -> &JobRef {
        &self.record.job_ref
    }

    /// The job as it was marked `started`
    pub fn job(&self) -> &JobRecord {
        &self.record
    }

    /// Report the outcome: `error` marks the job failed, `results` are passed to the producer.
    ///
    /// If the stored job was already closed by another run the outcome is
    /// dropped: the job is left as it is and no completion is written.
    #[instrument(skip(self, error, results), fields(job_ref = %self.record.job_ref))]
    pub async fn complete(self, error: Option<Value>, results: Vec<Value>) -> BrokerResult<()> {
        let Done { inner, record } = self;
        let failed = error.is_some();

        let transition = JobTransition::Finish { failed, at: Utc::now() };
        match inner.jobs.transition(record.job_ref.as_str(), transition).await {
            Ok(_) => {}
            Err(BrokerError::InvalidTransition { from, .. }) => {
                debug!("Dropping outcome of job {}: already {}", record.job_ref, from);
                return Ok(());
            }
            // The completion record is written even when the status update is lost
            Err(error) => {
                warn!("Could not persist outcome of job {}: {}", record.job_ref, error);
                inner.emit(BrokerEvent::error(format!("finish {}: {}", record.job_ref, error)));
            }
        }

        let completion = inner
            .completions
            .insert(CompletionRecord::new(record.job_ref.clone(), error, results))
            .await?;

        // Waiters are one-shot, so the copy arriving through the completion tail finds none here
        inner.bus.emit_ref(&completion);

        if inner.config.debug {
            debug!("Job {} {}", record.job_ref, if failed { "failed" } else { "completed" });
        }
        let at = Utc::now();
        inner.emit(if failed {
            BrokerEvent::Failed { job_ref: record.job_ref, at }
        } else {
            BrokerEvent::Completed { job_ref: record.job_ref, at }
        });

        Ok(())
    }

    /// Report success
    pub async fn ok(self, results: Vec<Value>) -> BrokerResult<()> {
        self.complete(None, results).await
    }

    /// Report failure
    pub async fn fail(self, error: Value) -> BrokerResult<()> {
        self.complete(Some(error), Vec::new()).await
    }
}
