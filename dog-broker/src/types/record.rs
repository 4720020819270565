use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobRef;
use crate::{BrokerError, BrokerResult};

/// Namespace reserved for the readiness placeholder written into empty logs
pub const PLACEHOLDER_NAMESPACE: &str = "$dog-broker.placeholder";

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Published and waiting for a subscriber
    #[default]
    New,

    /// Claimed by a subscriber that has not reported back yet
    Started,

    /// Handler reported success
    Completed,

    /// Handler reported an error
    Failed,
}

impl JobStatus {
    /// Whether `next` is a legal successor of this status.
    ///
    /// `started -> started` covers timeout redelivery and concurrent
    /// subscribers; `failed -> started` covers redelivery of failed work.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (New, Started)
                | (Started, Started)
                | (Started, Completed)
                | (Started, Failed)
                | (Failed, Started)
        )
    }

    /// Check if the status is terminal for this delivery
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the status name as a string
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Job record as stored in the job log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Correlation reference, fixed at creation
    #[serde(rename = "ref")]
    pub job_ref: JobRef,

    /// Routing key
    pub namespace: String,

    /// Opaque producer payload
    pub contents: Value,

    /// Current status
    pub status: JobStatus,

    /// When the job was created
    pub created: DateTime<Utc>,

    /// When the job last transitioned to `started`
    pub started: Option<DateTime<Utc>>,

    /// When the job last reached `completed` or `failed`
    pub completed: Option<DateTime<Utc>>,

    /// Number of times the job has been started
    #[serde(default)]
    pub attempts: u32,
}

impl JobRecord {
    /// Create a new job record in the `new` state
    pub fn new(namespace: impl Into<String>, contents: Value) -> BrokerResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;

        Ok(Self {
            job_ref: JobRef::new(),
            namespace,
            contents,
            status: JobStatus::New,
            created: Utc::now(),
            started: None,
            completed: None,
            attempts: 0,
        })
    }

    /// Record written into an empty job log so a tail can be opened on it
    pub fn placeholder() -> Self {
        Self {
            job_ref: JobRef::new(),
            namespace: PLACEHOLDER_NAMESPACE.to_string(),
            contents: Value::Null,
            status: JobStatus::Completed,
            created: Utc::now(),
            started: None,
            completed: None,
            attempts: 0,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.namespace == PLACEHOLDER_NAMESPACE
    }

    /// Claim the job for a handler run
    pub fn start(&mut self, now: DateTime<Utc>) -> BrokerResult<()> {
        self.transition(JobStatus::Started)?;
        self.started = Some(now);
        self.attempts += 1;
        Ok(())
    }

    /// Close the current run as completed or failed
    pub fn finish(&mut self, failed: bool, now: DateTime<Utc>) -> BrokerResult<()> {
        let next = if failed { JobStatus::Failed } else { JobStatus::Completed };
        self.transition(next)?;
        self.completed = Some(now);
        Ok(())
    }

    /// Apply a status change checked against this record's current status
    pub fn apply(&mut self, transition: JobTransition) -> BrokerResult<()> {
        match transition {
            JobTransition::Start { at } => self.start(at),
            JobTransition::Finish { failed, at } => self.finish(failed, at),
        }
    }

    fn transition(&mut self, next: JobStatus) -> BrokerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BrokerError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// A `started` job whose claim is older than `timeout`
    pub fn is_abandoned(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Started {
            return false;
        }
        let Some(started) = self.started else {
            return false;
        };
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .map_or(false, |cutoff| started < cutoff)
    }

    /// New or failed work, or work whose claim timed out
    pub fn is_actionable(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.is_placeholder() {
            return false;
        }
        matches!(self.status, JobStatus::New | JobStatus::Failed) || self.is_abandoned(timeout, now)
    }

    /// Failed or abandoned work still under the attempt cap
    pub fn is_redeliverable(
        &self,
        timeout: Duration,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_placeholder() {
            return false;
        }
        if max_attempts.is_some_and(|max| self.attempts >= max) {
            return false;
        }
        self.status == JobStatus::Failed || self.is_abandoned(timeout, now)
    }

    pub fn matches(&self, filter: &JobFilter, now: DateTime<Utc>) -> bool {
        match filter {
            JobFilter::All => true,
            JobFilter::Actionable { timeout } => self.is_actionable(*timeout, now),
            JobFilter::Redeliverable { timeout, max_attempts } => {
                self.is_redeliverable(*timeout, *max_attempts, now)
            }
            JobFilter::Ref(job_ref) => &self.job_ref == job_ref,
            JobFilter::Namespace(namespace) => &self.namespace == namespace,
            JobFilter::Status(status) => self.status == *status && !self.is_placeholder(),
        }
    }
}

/// Status change applied to the stored copy of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    /// Mark the job `started` and count the attempt
    Start { at: DateTime<Utc> },

    /// Close the running attempt as `completed` or `failed`
    Finish { failed: bool, at: DateTime<Utc> },
}

/// Query predicate over job records
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobFilter {
    /// Every record, placeholders included
    #[default]
    All,

    /// `status in {new, failed}` or `started` longer ago than `timeout`
    Actionable { timeout: Duration },

    /// `failed`, or `started` longer ago than `timeout`, below the attempt cap
    Redeliverable {
        timeout: Duration,
        max_attempts: Option<u32>,
    },

    /// The record with this ref
    Ref(JobRef),

    /// Records routed to this namespace
    Namespace(String),

    /// Records currently in this status
    Status(JobStatus),
}

pub(crate) fn validate_namespace(namespace: &str) -> BrokerResult<()> {
    if namespace.trim().is_empty() {
        return Err(BrokerError::validation("namespace is required"));
    }
    if namespace == PLACEHOLDER_NAMESPACE {
        return Err(BrokerError::validation(format!("namespace '{}' is reserved", namespace)));
    }
    Ok(())
}
