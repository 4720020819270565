use std::collections::VecDeque;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use crate::{
    BrokerResult, BrokerError, LogCapabilities,
    log::{DurableLog, LogRecord, TailStream},
};

/// Default number of records kept before the oldest are evicted
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Records buffered per tail before a slow cursor starts lagging
pub const DEFAULT_TAIL_BUFFER: usize = 1024;

/// In-memory capped log for testing and development
pub struct MemoryLog<R: LogRecord> {
    name: String,

    /// Eviction threshold; zero disables capping
    max_records: usize,

    /// Records in insertion order
    pub(crate) records: Arc<RwLock<VecDeque<R>>>,

    /// Live feed for tail cursors
    tail_tx: broadcast::Sender<BrokerResult<R>>,

    capabilities: LogCapabilities,
}

impl<R: LogRecord> MemoryLog<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::capped(name, DEFAULT_MAX_RECORDS)
    }

    /// Create a log holding at most `max_records` records
    pub fn capped(name: impl Into<String>, max_records: usize) -> Self {
        let (tail_tx, _) = broadcast::channel(DEFAULT_TAIL_BUFFER);

        Self {
            name: name.into(),
            max_records,
            records: Arc::new(RwLock::new(VecDeque::new())),
            tail_tx,
            capabilities: LogCapabilities {
                capped: max_records > 0,
                ..LogCapabilities::all()
            },
        }
    }

    /// Override advertised capabilities
    pub fn with_capabilities(mut self, capabilities: LogCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Push an error to every open tail (test helper)
    pub fn inject_tail_error(&self, error: BrokerError) {
        let _ = self.tail_tx.send(Err(error));
    }

    /// Number of tail cursors currently open
    pub fn open_tails(&self) -> usize {
        self.tail_tx.receiver_count()
    }
}

#[async_trait]
impl<R: LogRecord> DurableLog<R> for MemoryLog<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, record: R) -> BrokerResult<R> {
        let mut records = self.records.write();

        if self.max_records > 0 {
            while records.len() >= self.max_records {
                records.pop_front();
            }
        }
        records.push_back(record.clone());

        // Sent under the write lock so tails opened concurrently never see a record twice
        let _ = self.tail_tx.send(Ok(record.clone()));

        Ok(record)
    }

    async fn update(&self, record: R) -> BrokerResult<()> {
        let mut records = self.records.write();

        let slot = records
            .iter_mut()
            .rev()
            .find(|existing| existing.key() == record.key())
            .ok_or_else(|| BrokerError::RecordNotFound {
                log: self.name.clone(),
                key: record.key().to_string(),
            })?;
        *slot = record;

        Ok(())
    }

    async fn transition(&self, key: &str, transition: R::Transition) -> BrokerResult<R> {
        let mut records = self.records.write();

        let slot = records
            .iter_mut()
            .rev()
            .find(|existing| existing.key() == key)
            .ok_or_else(|| BrokerError::RecordNotFound {
                log: self.name.clone(),
                key: key.to_string(),
            })?;

        let mut next = slot.clone();
        next.apply_transition(&transition)?;
        *slot = next.clone();

        Ok(next)
    }

    async fn count(&self, filter: &R::Filter) -> BrokerResult<usize> {
        let now = Utc::now();
        let records = self.records.read();
        Ok(records.iter().filter(|record| record.matches(filter, now)).count())
    }

    async fn find(&self, filter: &R::Filter) -> BrokerResult<Vec<R>> {
        let now = Utc::now();
        let records = self.records.read();
        Ok(records
            .iter()
            .filter(|record| record.matches(filter, now))
            .cloned()
            .collect())
    }

    async fn open_tail(&self, filter: R::Filter) -> BrokerResult<TailStream<R>> {
        let (replay, receiver) = {
            let records = self.records.read();
            if records.is_empty() {
                return Err(BrokerError::EmptyLog(self.name.clone()));
            }

            // Subscribe while holding the read lock: no insert can slip between snapshot and feed
            let receiver = self.tail_tx.subscribe();
            let now = Utc::now();
            let replay: Vec<BrokerResult<R>> = records
                .iter()
                .filter(|record| record.matches(&filter, now))
                .cloned()
                .map(Ok)
                .collect();

            (replay, receiver)
        };

        let name = self.name.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(Ok(record)) => record.matches(&filter, Utc::now()).then_some(Ok(record)),
            Ok(Err(error)) => Some(Err(error)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(BrokerError::TailLagged {
                log: name.clone(),
                skipped,
            })),
        });

        Ok(Box::pin(tokio_stream::iter(replay).chain(live)))
    }

    fn capabilities(&self) -> LogCapabilities {
        self.capabilities.clone()
    }
}
