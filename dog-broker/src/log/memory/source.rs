use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;

use crate::{
    BrokerError, BrokerResult, CompletionRecord, JobRecord, LogCapabilities,
    log::{DurableLog, LogRecord, LogSource},
};

use super::storage::{MemoryLog, DEFAULT_MAX_RECORDS};

type Logs<R> = Arc<RwLock<HashMap<String, Arc<MemoryLog<R>>>>>;

/// Registry of named in-memory logs.
///
/// Clones share the same logs, so brokers started from one source see each
/// other's jobs and completions.
#[derive(Clone)]
pub struct MemorySource {
    max_records: usize,
    capabilities: LogCapabilities,
    job_logs: Logs<JobRecord>,
    completion_logs: Logs<CompletionRecord>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }

    /// Logs created by this source keep at most `max_records` records
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            max_records,
            capabilities: LogCapabilities {
                capped: max_records > 0,
                ..LogCapabilities::all()
            },
            job_logs: Arc::new(RwLock::new(HashMap::new())),
            completion_logs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Advertise different capabilities on every log created afterwards
    pub fn with_capabilities(mut self, capabilities: LogCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Typed handle on a job log, created on first use
    pub fn jobs(&self, name: &str) -> BrokerResult<Arc<MemoryLog<JobRecord>>> {
        self.get_or_create(&self.job_logs, name)
    }

    /// Typed handle on a completion log, created on first use
    pub fn completions(&self, name: &str) -> BrokerResult<Arc<MemoryLog<CompletionRecord>>> {
        self.get_or_create(&self.completion_logs, name)
    }

    fn get_or_create<R: LogRecord>(&self, logs: &Logs<R>, name: &str) -> BrokerResult<Arc<MemoryLog<R>>> {
        if name.trim().is_empty() {
            return Err(BrokerError::configuration("collection name is required"));
        }

        if let Some(log) = logs.read().get(name) {
            return Ok(log.clone());
        }

        let mut logs = logs.write();
        let log = logs.entry(name.to_string()).or_insert_with(|| {
            Arc::new(
                MemoryLog::capped(name, self.max_records).with_capabilities(self.capabilities.clone()),
            )
        });
        Ok(log.clone())
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSource for MemorySource {
    fn job_log(&self, name: &str) -> BrokerResult<Arc<dyn DurableLog<JobRecord>>> {
        Ok(self.jobs(name)?)
    }

    fn completion_log(&self, name: &str) -> BrokerResult<Arc<dyn DurableLog<CompletionRecord>>> {
        Ok(self.completions(name)?)
    }
}
