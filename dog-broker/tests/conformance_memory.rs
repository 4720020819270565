use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;

use dog_broker::{
    log::{memory::DEFAULT_TAIL_BUFFER, BoxStream}, Broker, BrokerConfig, BrokerError, BrokerEvent, BrokerResult, Completion,
    CompletionFilter, CompletionRecord, DurableLog, JobFilter, JobRecord, JobRef, JobStatus,
    JobTransition, LogCapabilities, LogSource, MemoryLog, MemorySource, TailStream,
};

/// Test factory functions
fn create_test_config() -> BrokerConfig {
    BrokerConfig::default()
}

async fn create_test_broker() -> (MemorySource, Broker) {
    let source = MemorySource::new();
    let broker = Broker::start(&source, create_test_config()).await.unwrap();
    (source, broker)
}

async fn receive<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Channel closed")
}

async fn receive_next_event(stream: &mut BoxStream<BrokerEvent>) -> BrokerEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended")
}

async fn receive_event_named(stream: &mut BoxStream<BrokerEvent>, name: &str) -> BrokerEvent {
    loop {
        let event = receive_next_event(stream).await;
        if event.event_name() == name {
            return event;
        }
    }
}

fn completion_channel() -> (
    Box<dyn FnOnce(BrokerResult<Completion>) + Send>,
    oneshot::Receiver<BrokerResult<Completion>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |result: BrokerResult<Completion>| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

async fn await_completion(rx: oneshot::Receiver<BrokerResult<Completion>>) -> BrokerResult<Completion> {
    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("Timeout waiting for completion")
        .expect("Callback dropped")
}

/// B1. Published payload reaches the handler unchanged
#[tokio::test]
async fn test_payload_round_trip() {
    let (_source, broker) = create_test_broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.echo", move |payload, done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((payload, done.job_ref().clone()));
                done.ok(vec![]).await.unwrap();
            }
        })
        .unwrap();

    let payload = json!({ "foo": "bar", "nested": { "list": [1, 2, 3] } });
    let handle = broker.publish("jobs.echo", payload.clone(), None).unwrap();

    let (received, job_ref) = receive(&mut rx).await;
    assert_eq!(received, payload);
    assert_eq!(job_ref, handle.job_ref);
}

/// B2. Results flow back to the producer callback
#[tokio::test]
async fn test_double_job_completes_with_result() {
    let (_source, broker) = create_test_broker().await;

    broker
        .subscribe("jobs.double", |payload, done| async move {
            let n = payload["n"].as_i64().unwrap_or(0);
            done.ok(vec![json!(n * 2)]).await.unwrap();
        })
        .unwrap();

    let (callback, rx) = completion_channel();
    broker.publish("jobs.double", json!({ "n": 21 }), Some(callback)).unwrap();

    let completion = await_completion(rx).await.unwrap();
    assert_eq!(completion.params, vec![Value::Null, json!(42)]);
    assert!(completion.is_success());
}

/// B3. Every result argument is passed through in order, and only to its own ref
#[tokio::test]
async fn test_completion_args_pass_through() {
    let (_source, broker) = create_test_broker().await;

    broker
        .subscribe("jobs.args", |payload, done| async move {
            if payload["reply"].as_bool() == Some(true) {
                done.ok(vec![json!("a"), json!("b"), json!("c")]).await.unwrap();
            }
        })
        .unwrap();

    let (other_callback, mut other_rx) = completion_channel();
    broker.publish("jobs.args", json!({ "reply": false }), Some(other_callback)).unwrap();

    let (callback, rx) = completion_channel();
    let handle = broker.publish("jobs.args", json!({ "reply": true }), Some(callback)).unwrap();

    let completion = await_completion(rx).await.unwrap();
    assert_eq!(completion.job_ref, handle.job_ref);
    assert_eq!(completion.params, vec![Value::Null, json!("a"), json!("b"), json!("c")]);
    assert_eq!(completion.results(), &[json!("a"), json!("b"), json!("c")]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(other_rx.try_recv().is_err());
}

/// B4. Handler errors mark the job failed and reach the producer
#[tokio::test]
async fn test_handler_error_reaches_producer() {
    let (source, broker) = create_test_broker().await;

    broker
        .subscribe("jobs.fail", |_, done| async move {
            done.fail(json!({ "message": "boom" })).await.unwrap();
        })
        .unwrap();

    let completion = tokio::time::timeout(
        Duration::from_secs(1),
        broker.request("jobs.fail", json!({})),
    )
    .await
    .expect("Timeout waiting for completion")
    .unwrap();

    assert_eq!(completion.error(), Some(&json!({ "message": "boom" })));
    assert!(completion.results().is_empty());

    let jobs = source.jobs("dog_broker_jobs").unwrap();
    let stored = jobs.find(&JobFilter::Ref(completion.job_ref.clone())).await.unwrap();
    assert_eq!(stored[0].status, JobStatus::Failed);
    assert!(stored[0].completed.is_some());
}

/// B5. Every subscriber of a namespace receives the job
#[tokio::test]
async fn test_fanout_to_all_subscribers() {
    let (_source, broker) = create_test_broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for name in ["first", "second"] {
        let tx = tx.clone();
        broker
            .subscribe("jobs.fanout", move |payload, done| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((name, payload, done.job_ref().clone()));
                }
            })
            .unwrap();
    }

    let handle = broker.publish("jobs.fanout", json!({ "x": 1 }), None).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..2 {
        let (name, payload, job_ref) = receive(&mut rx).await;
        assert_eq!(payload, json!({ "x": 1 }));
        assert_eq!(job_ref, handle.job_ref);
        seen.insert(name);
    }
    assert_eq!(seen.len(), 2);
}

/// B6. Jobs only reach their own namespace
#[tokio::test]
async fn test_namespace_isolation() {
    let (_source, broker) = create_test_broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.a", move |payload, _done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        })
        .unwrap();

    broker.publish("jobs.b", json!("for b"), None).unwrap();
    broker.publish("jobs.a", json!("for a"), None).unwrap();

    assert_eq!(receive(&mut rx).await, json!("for a"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

/// B7. Two subscribers racing on one job: the first outcome sticks
#[tokio::test]
async fn test_fanout_first_outcome_wins() {
    let (source, broker) = create_test_broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let ok_tx = tx.clone();
    broker
        .subscribe("jobs.race", move |_, done| {
            let tx = ok_tx.clone();
            async move {
                done.ok(vec![json!("fast")]).await.unwrap();
                let _ = tx.send("ok");
            }
        })
        .unwrap();
    broker
        .subscribe("jobs.race", move |_, done| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.fail(json!("slow")).await.unwrap();
                let _ = tx.send("fail");
            }
        })
        .unwrap();

    let (callback, completion_rx) = completion_channel();
    let handle = broker.publish("jobs.race", json!({}), Some(callback)).unwrap();

    let completion = await_completion(completion_rx).await.unwrap();
    assert!(completion.is_success());
    assert_eq!(completion.results(), &[json!("fast")]);

    // Give the slow subscriber time to report, if it ran at all
    assert_eq!(receive(&mut rx).await, "ok");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let jobs = source.jobs("dog_broker_jobs").unwrap();
    let stored = jobs.find(&JobFilter::Ref(handle.job_ref.clone())).await.unwrap();
    assert_eq!(stored[0].status, JobStatus::Completed);

    let completions = source.completions("dog_broker_completions").unwrap();
    let written = completions.count(&CompletionFilter::Ref(handle.job_ref.clone())).await.unwrap();
    assert_eq!(written, 1);

    assert_eq!(broker.sweep_once().await.unwrap(), 0);
}

/// B8. A publish burst larger than the tail buffer is delivered in full
#[tokio::test]
async fn test_publish_burst_beyond_tail_buffer() {
    let source = MemorySource::new();
    let config = create_test_config()
        .with_tail_reopen(5, Duration::from_millis(1), Duration::from_millis(10));
    let broker = Broker::start(&source, config).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.burst", move |_, done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(done.job_ref().clone());
                done.ok(vec![]).await.unwrap();
            }
        })
        .unwrap();

    let total = DEFAULT_TAIL_BUFFER + 476;
    let published: HashSet<JobRef> = (0..total)
        .map(|i| broker.publish("jobs.burst", json!(i), None).unwrap().job_ref)
        .collect();

    // Redelivery may repeat a job; every one must arrive at least once
    let mut handled = HashSet::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(job_ref) = rx.recv().await {
            handled.insert(job_ref);
            if handled.len() == total {
                break;
            }
        }
    })
    .await
    .expect("Burst was not fully delivered");

    assert_eq!(handled, published);
    let jobs = source.jobs("dog_broker_jobs").unwrap();
    assert_eq!(jobs.count(&JobFilter::Status(JobStatus::New)).await.unwrap(), 0);
}

/// C1. A handler that never completes gets the same job again after the timeout
#[tokio::test]
async fn test_abandoned_job_is_redelivered() {
    let source = MemorySource::new();
    let config = create_test_config().with_retry_timeout(Duration::ZERO);
    let broker = Broker::start(&source, config).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.stuck", move |_, done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((done.job_ref().clone(), done.job().attempts));
                // never completes
            }
        })
        .unwrap();

    let handle = broker.publish("jobs.stuck", json!({}), None).unwrap();

    let (first_ref, first_attempt) = receive(&mut rx).await;
    assert_eq!(first_ref, handle.job_ref);
    assert_eq!(first_attempt, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.sweep_once().await.unwrap(), 1);

    let (second_ref, second_attempt) = receive(&mut rx).await;
    assert_eq!(second_ref, handle.job_ref);
    assert_eq!(second_attempt, 2);
}

/// C2. Jobs in progress within the timeout are left alone
#[tokio::test]
async fn test_running_job_not_redelivered() {
    let (_source, broker) = create_test_broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.slow", move |_, done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(done.job_ref().clone());
            }
        })
        .unwrap();

    broker.publish("jobs.slow", json!({}), None).unwrap();
    receive(&mut rx).await;

    assert_eq!(broker.sweep_once().await.unwrap(), 0);
}

/// C3. Failed jobs are redelivered until the attempt cap
#[tokio::test]
async fn test_failed_job_redelivery_respects_max_attempts() {
    let source = MemorySource::new();
    let config = create_test_config().with_max_attempts(2);
    let broker = Broker::start(&source, config).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.flaky", move |_, done| {
            let tx = tx.clone();
            async move {
                let attempts = done.job().attempts;
                done.fail(json!("flaky")).await.unwrap();
                let _ = tx.send(attempts);
            }
        })
        .unwrap();

    broker.publish("jobs.flaky", json!({}), None).unwrap();
    assert_eq!(receive(&mut rx).await, 1);

    assert_eq!(broker.sweep_once().await.unwrap(), 1);
    assert_eq!(receive(&mut rx).await, 2);

    assert_eq!(broker.sweep_once().await.unwrap(), 0);
}

/// C4. Redelivery shows up on the event stream
#[tokio::test]
async fn test_redelivery_event() {
    let source = MemorySource::new();
    let broker = Broker::start(&source, create_test_config()).await.unwrap();

    let mut record = JobRecord::new("jobs.unclaimed", json!({})).unwrap();
    record.start(Utc::now() - chrono::Duration::hours(1)).unwrap();
    source.jobs("dog_broker_jobs").unwrap().insert(record.clone()).await.unwrap();

    let mut events = broker.events();
    assert_eq!(broker.sweep_once().await.unwrap(), 1);

    match receive_event_named(&mut events, "redelivered").await {
        BrokerEvent::Redelivered { job_ref, namespace, attempts, .. } => {
            assert_eq!(job_ref, record.job_ref);
            assert_eq!(namespace, "jobs.unclaimed");
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

/// D1. Status walks new -> started -> completed
#[tokio::test]
async fn test_status_progression_is_persisted() {
    let (source, broker) = create_test_broker().await;
    let jobs = source.jobs("dog_broker_jobs").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

    broker
        .subscribe("jobs.status", move |_, done| {
            let tx = tx.clone();
            let release_rx = release_rx.clone();
            async move {
                let _ = tx.send(done.job_ref().clone());
                release_rx.lock().await.recv().await;
                done.ok(vec![]).await.unwrap();
            }
        })
        .unwrap();

    let (callback, completion_rx) = completion_channel();
    let handle = broker.publish("jobs.status", json!({}), Some(callback)).unwrap();
    assert_eq!(handle.record.status, JobStatus::New);

    let job_ref = receive(&mut rx).await;
    let started = jobs.find(&JobFilter::Ref(job_ref.clone())).await.unwrap();
    assert_eq!(started[0].status, JobStatus::Started);
    assert_eq!(started[0].attempts, 1);
    assert!(started[0].started.is_some());

    release_tx.send(()).unwrap();
    await_completion(completion_rx).await.unwrap();

    let completed = jobs.find(&JobFilter::Ref(job_ref)).await.unwrap();
    assert_eq!(completed[0].status, JobStatus::Completed);
    assert!(completed[0].completed.is_some());
}

/// D2. Blank namespaces are rejected
#[tokio::test]
async fn test_blank_namespace_rejected() {
    let (_source, broker) = create_test_broker().await;

    let publish = broker.publish("", json!({}), None);
    assert!(matches!(publish, Err(BrokerError::Validation(_))));

    let subscribe = broker.subscribe("", |_, _done| async {});
    assert!(matches!(subscribe, Err(BrokerError::Validation(_))));
}

/// D3. Logs without tail, update or replay support cannot host a broker
#[tokio::test]
async fn test_incapable_log_rejected() {
    let source = MemorySource::new().with_capabilities(LogCapabilities::minimal());
    let result = Broker::start(&source, create_test_config()).await;

    match result {
        Err(BrokerError::BackendUnsupported { log, feature }) => {
            assert_eq!(log, "dog_broker_jobs");
            assert_eq!(feature, "tail, update_in_place, replay_on_open");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("broker started on an incapable log"),
    }
}

/// D4. A log that cannot replay on open is refused
#[tokio::test]
async fn test_log_without_replay_rejected() {
    let capabilities = LogCapabilities { replay_on_open: false, ..LogCapabilities::all() };
    let source = MemorySource::new().with_capabilities(capabilities);

    match Broker::start(&source, create_test_config()).await {
        Err(BrokerError::BackendUnsupported { feature, .. }) => assert_eq!(feature, "replay_on_open"),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("broker started without replay on open"),
    }
}

/// E1. Tail errors surface as broker errors, not on topics
#[tokio::test]
async fn test_tail_error_becomes_broker_event() {
    let (source, broker) = create_test_broker().await;
    let mut events = broker.events();

    source
        .jobs("dog_broker_jobs")
        .unwrap()
        .inject_tail_error(BrokerError::storage("cursor died"));

    match receive_event_named(&mut events, "error").await {
        BrokerEvent::Error { message, .. } => assert!(message.contains("cursor died")),
        other => panic!("unexpected event: {:?}", other),
    }

    // tail keeps running afterwards
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe("jobs.after", move |payload, _done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        })
        .unwrap();
    broker.publish("jobs.after", json!(1), None).unwrap();
    assert_eq!(receive(&mut rx).await, json!(1));
}

/// E2. Insert failures go to the producer callback
#[tokio::test]
async fn test_failed_insert_reaches_callback() {
    let source = WrappedSource::new(FlakyLog::new);
    let broker = Broker::start(&source, create_test_config()).await.unwrap();

    source.jobs.fail_inserts.store(true, Ordering::SeqCst);

    let (callback, rx) = completion_channel();
    broker.publish("jobs.lost", json!({}), Some(callback)).unwrap();

    let result = await_completion(rx).await;
    assert_eq!(result.unwrap_err(), BrokerError::storage("insert refused"));

    let err = broker.request("jobs.lost", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::Storage(_)));
}

/// E3. Brokers sharing logs cooperate
#[tokio::test]
async fn test_brokers_share_logs() {
    let source = MemorySource::new();
    let producer = Broker::start(&source, create_test_config()).await.unwrap();
    let worker = Broker::start(&source.clone(), create_test_config()).await.unwrap();

    worker
        .subscribe("jobs.remote", |payload, done| async move {
            done.ok(vec![payload]).await.unwrap();
        })
        .unwrap();

    let completion = tokio::time::timeout(
        Duration::from_secs(1),
        producer.request("jobs.remote", json!("hello")),
    )
    .await
    .expect("Timeout waiting for completion")
    .unwrap();

    assert_eq!(completion.results(), &[json!("hello")]);
}

/// E4. Lifecycle events are emitted in order for a job
#[tokio::test]
async fn test_lifecycle_events() {
    let (_source, broker) = create_test_broker().await;
    let mut events = broker.events();

    broker
        .subscribe("jobs.events", |_, done| async move {
            done.ok(vec![]).await.unwrap();
        })
        .unwrap();

    let handle = broker.publish("jobs.events", json!({}), None).unwrap();

    let mut names = Vec::new();
    while names.last() != Some(&"completed") {
        let event = receive_next_event(&mut events).await;
        if event.job_ref() == Some(&handle.job_ref) {
            names.push(event.event_name());
        }
    }

    let position = |name| names.iter().position(|n| *n == name).unwrap();
    assert!(position("delivered") < position("started"));
    assert!(position("started") < position("completed"));
    assert!(names.contains(&"published"));
}

/// E5. Shutdown stops the bridges and the sweep
#[tokio::test]
async fn test_shutdown_closes_tails() {
    let (source, broker) = create_test_broker().await;
    let jobs = source.jobs("dog_broker_jobs").unwrap();
    let completions = source.completions("dog_broker_completions").unwrap();

    broker.shutdown().await.unwrap();

    assert_eq!(jobs.open_tails(), 0);
    assert_eq!(completions.open_tails(), 0);
}

/// E6. A tail that ends is reopened and picks up jobs published meanwhile
#[tokio::test]
async fn test_ended_tail_is_reopened() {
    let source = WrappedSource::new(EndingTailLog::new);
    let config = create_test_config()
        .with_tail_reopen(3, Duration::from_millis(5), Duration::from_millis(20));
    let broker = Broker::start(&source, config).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe("jobs.resume", move |payload, done| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
                done.ok(vec![]).await.unwrap();
            }
        })
        .unwrap();
    broker.publish("jobs.resume", json!("after reopen"), None).unwrap();

    assert_eq!(receive(&mut rx).await, json!("after reopen"));
    assert!(source.jobs.opens() >= 2);
}

/// E7. Records arriving on a reopened tail reset the failure budget
#[tokio::test]
async fn test_tail_failure_budget_resets() {
    let source = WrappedSource::new(EndingTailLog::new);
    // Waiting with no subscriber, so every replay yields it
    source.jobs.insert(JobRecord::new("jobs.idle", json!({})).unwrap()).await.unwrap();

    let config = create_test_config()
        .with_tail_reopen(1, Duration::from_millis(1), Duration::from_millis(5));
    let _broker = Broker::start(&source, config).await.unwrap();

    // With a budget of one, the bridge would stop after the second open without the reset
    wait_for_opens(&source.jobs, 6).await;
}

/// E8. A tail that cannot be reopened stops with a final error event
#[tokio::test]
async fn test_tail_gives_up_after_reopen_attempts() {
    let source = WrappedSource::new(EndingTailLog::new);
    source.jobs.refuse_reopen.store(true, Ordering::SeqCst);

    let config = create_test_config()
        .with_tail_reopen(2, Duration::from_millis(1), Duration::from_millis(5));
    let broker = Broker::start(&source, config).await.unwrap();
    let mut events = broker.events();

    loop {
        match receive_event_named(&mut events, "error").await {
            BrokerEvent::Error { message, .. } if message.contains("stopped after") => {
                assert_eq!(message, "tail on 'dog_broker_jobs' stopped after 3 failure(s)");
                break;
            }
            _ => continue,
        }
    }

    // initial open plus two refused reopens
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(source.jobs.opens(), 3);
}

proptest! {
    /// Every published job carries a unique ref
    #[test]
    fn prop_publish_refs_are_unique(count in 1usize..64) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let refs = runtime.block_on(async {
            let (_source, broker) = create_test_broker().await;
            (0..count)
                .map(|i| broker.publish("jobs.unique", json!(i), None).unwrap().job_ref)
                .collect::<Vec<JobRef>>()
        });

        let unique: HashSet<_> = refs.iter().collect();
        prop_assert_eq!(unique.len(), count);
    }

    /// Observed statuses always follow new, started+, then completed or failed
    #[test]
    fn prop_status_order(steps in proptest::collection::vec(0u8..3, 0..12)) {
        let mut record = JobRecord::new("jobs.prop", json!({})).unwrap();
        let mut history = vec![record.status];

        for step in steps {
            let applied = match step {
                0 => record.start(Utc::now()),
                1 => record.finish(false, Utc::now()),
                _ => record.finish(true, Utc::now()),
            };
            if applied.is_ok() {
                history.push(record.status);
            }
        }

        prop_assert_eq!(history[0], JobStatus::New);
        for pair in history.windows(2) {
            prop_assert!(pair[0].can_transition_to(pair[1]));
        }
        if let Some(index) = history.iter().position(|s| *s == JobStatus::Completed) {
            prop_assert_eq!(index, history.len() - 1);
        }
    }
}

/// Memory source whose job log is wrapped by a test double
struct WrappedSource<L> {
    inner: MemorySource,
    jobs: Arc<L>,
}

impl<L: DurableLog<JobRecord> + 'static> WrappedSource<L> {
    fn new(wrap: impl FnOnce(Arc<MemoryLog<JobRecord>>) -> L) -> Self {
        let inner = MemorySource::new();
        let jobs = Arc::new(wrap(inner.jobs("dog_broker_jobs").unwrap()));
        Self { inner, jobs }
    }
}

impl<L: DurableLog<JobRecord> + 'static> LogSource for WrappedSource<L> {
    fn job_log(&self, _name: &str) -> BrokerResult<Arc<dyn DurableLog<JobRecord>>> {
        Ok(self.jobs.clone())
    }

    fn completion_log(&self, name: &str) -> BrokerResult<Arc<dyn DurableLog<CompletionRecord>>> {
        self.inner.completion_log(name)
    }
}

/// Job log that can be told to refuse inserts
struct FlakyLog {
    log: Arc<MemoryLog<JobRecord>>,
    fail_inserts: AtomicBool,
}

impl FlakyLog {
    fn new(log: Arc<MemoryLog<JobRecord>>) -> Self {
        Self { log, fail_inserts: AtomicBool::new(false) }
    }
}

#[async_trait]
impl DurableLog<JobRecord> for FlakyLog {
    fn name(&self) -> &str {
        self.log.name()
    }

    async fn insert(&self, record: JobRecord) -> BrokerResult<JobRecord> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(BrokerError::storage("insert refused"));
        }
        self.log.insert(record).await
    }

    async fn update(&self, record: JobRecord) -> BrokerResult<()> {
        self.log.update(record).await
    }

    async fn transition(&self, key: &str, transition: JobTransition) -> BrokerResult<JobRecord> {
        self.log.transition(key, transition).await
    }

    async fn count(&self, filter: &JobFilter) -> BrokerResult<usize> {
        self.log.count(filter).await
    }

    async fn find(&self, filter: &JobFilter) -> BrokerResult<Vec<JobRecord>> {
        self.log.find(filter).await
    }

    async fn open_tail(&self, filter: JobFilter) -> BrokerResult<TailStream<JobRecord>> {
        self.log.open_tail(filter).await
    }

    fn capabilities(&self) -> LogCapabilities {
        self.log.capabilities()
    }
}

/// Job log whose tails end right after replaying the stored records
struct EndingTailLog {
    log: Arc<MemoryLog<JobRecord>>,
    opens: AtomicUsize,
    /// Refuse every open after the first
    refuse_reopen: AtomicBool,
}

impl EndingTailLog {
    fn new(log: Arc<MemoryLog<JobRecord>>) -> Self {
        Self { log, opens: AtomicUsize::new(0), refuse_reopen: AtomicBool::new(false) }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

async fn wait_for_opens(log: &EndingTailLog, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while log.opens() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Tail was not reopened");
}

#[async_trait]
impl DurableLog<JobRecord> for EndingTailLog {
    fn name(&self) -> &str {
        self.log.name()
    }

    async fn insert(&self, record: JobRecord) -> BrokerResult<JobRecord> {
        self.log.insert(record).await
    }

    async fn update(&self, record: JobRecord) -> BrokerResult<()> {
        self.log.update(record).await
    }

    async fn transition(&self, key: &str, transition: JobTransition) -> BrokerResult<JobRecord> {
        self.log.transition(key, transition).await
    }

    async fn count(&self, filter: &JobFilter) -> BrokerResult<usize> {
        self.log.count(filter).await
    }

    async fn find(&self, filter: &JobFilter) -> BrokerResult<Vec<JobRecord>> {
        self.log.find(filter).await
    }

    async fn open_tail(&self, filter: JobFilter) -> BrokerResult<TailStream<JobRecord>> {
        let previous = self.opens.fetch_add(1, Ordering::SeqCst);
        if previous > 0 && self.refuse_reopen.load(Ordering::SeqCst) {
            return Err(BrokerError::storage("cursor unavailable"));
        }

        let replay = self.log.find(&filter).await?;
        Ok(Box::pin(tokio_stream::iter(replay.into_iter().map(Ok))))
    }

    fn capabilities(&self) -> LogCapabilities {
        self.log.capabilities()
    }
}
