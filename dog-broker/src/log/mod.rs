pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::{
    BrokerResult, CompletionFilter, CompletionRecord, JobFilter, JobRecord, JobTransition,
    LogCapabilities,
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Live, order-preserving sequence of records; `Err` items report cursor failures
pub type TailStream<R> = BoxStream<BrokerResult<R>>;

/// A record kind that can live in a durable log
pub trait LogRecord: Clone + fmt::Debug + Send + Sync + 'static {
    /// Query predicate. `Default` must match every record.
    type Filter: Clone + Default + fmt::Debug + Send + Sync + 'static;

    /// Change applied to a stored record by [`DurableLog::transition`]
    type Transition: Clone + fmt::Debug + Send + Sync + 'static;

    /// Key used by in-place updates
    fn key(&self) -> &str;

    /// Evaluate a filter at time `now`
    fn matches(&self, filter: &Self::Filter, now: DateTime<Utc>) -> bool;

    /// Record written into an empty log so a tail can be opened
    fn placeholder() -> Self;

    fn is_placeholder(&self) -> bool;

    /// Apply `transition` to this record, refusing it if the current state does not allow it
    fn apply_transition(&mut self, transition: &Self::Transition) -> BrokerResult<()>;
}

impl LogRecord for JobRecord {
    type Filter = JobFilter;
    type Transition = JobTransition;

    fn key(&self) -> &str {
        self.job_ref.as_str()
    }

    fn matches(&self, filter: &JobFilter, now: DateTime<Utc>) -> bool {
        JobRecord::matches(self, filter, now)
    }

    fn placeholder() -> Self {
        JobRecord::placeholder()
    }

    fn is_placeholder(&self) -> bool {
        JobRecord::is_placeholder(self)
    }

    fn apply_transition(&mut self, transition: &JobTransition) -> BrokerResult<()> {
        self.apply(*transition)
    }
}

impl LogRecord for CompletionRecord {
    type Filter = CompletionFilter;
    // Completions are immutable once written
    type Transition = Infallible;

    fn key(&self) -> &str {
        self.job_ref.as_str()
    }

    fn matches(&self, filter: &CompletionFilter, _now: DateTime<Utc>) -> bool {
        CompletionRecord::matches(self, filter)
    }

    fn placeholder() -> Self {
        CompletionRecord::placeholder()
    }

    fn is_placeholder(&self) -> bool {
        CompletionRecord::is_placeholder(self)
    }

    fn apply_transition(&mut self, transition: &Infallible) -> BrokerResult<()> {
        match *transition {}
    }
}

/// Storage primitives the broker needs from a bounded, insertion-ordered log
#[async_trait]
pub trait DurableLog<R: LogRecord>: Send + Sync {
    /// Collection name, used in errors and logs
    fn name(&self) -> &str;

    /// Append a record
    async fn insert(&self, record: R) -> BrokerResult<R>;

    /// Replace the stored record that has the same key
    async fn update(&self, record: R) -> BrokerResult<()>;

    /// Atomically apply `transition` to the stored record with `key` and return the result.
    ///
    /// The transition is checked against the stored state, not a caller's
    /// copy, so a refused transition leaves the record untouched.
    async fn transition(&self, key: &str, transition: R::Transition) -> BrokerResult<R>;

    /// Count records matching a filter
    async fn count(&self, filter: &R::Filter) -> BrokerResult<usize>;

    /// Finite snapshot of matching records, oldest first
    async fn find(&self, filter: &R::Filter) -> BrokerResult<Vec<R>>;

    /// Open a tail cursor over records matching `filter`.
    ///
    /// Delivers records as they are inserted, in insertion order, and never
    /// completes on its own. Engines advertising `replay_on_open` first yield
    /// the matching records already stored.
    async fn open_tail(&self, filter: R::Filter) -> BrokerResult<TailStream<R>>;

    /// Get log capabilities
    fn capabilities(&self) -> LogCapabilities;
}

/// Resolves logs by collection name, like a database connection
pub trait LogSource: Send + Sync {
    fn job_log(&self, name: &str) -> BrokerResult<Arc<dyn DurableLog<JobRecord>>>;

    fn completion_log(&self, name: &str) -> BrokerResult<Arc<dyn DurableLog<CompletionRecord>>>;
}

/// Insert the placeholder record if the log is empty. Returns whether one was written.
pub async fn ensure_not_empty<R, L>(log: &L) -> BrokerResult<bool>
where
    R: LogRecord,
    L: DurableLog<R> + ?Sized,
{
    if log.count(&R::Filter::default()).await? > 0 {
        return Ok(false);
    }
    log.insert(R::placeholder()).await?;
    Ok(true)
}
