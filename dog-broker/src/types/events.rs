use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobRef;

/// Broker-level event stream for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// Job record was inserted into the job log
    Published {
        job_ref: JobRef,
        namespace: String,
        at: DateTime<Utc>,
    },

    /// Job was handed to a namespace topic
    Delivered {
        job_ref: JobRef,
        namespace: String,
        listeners: usize,
        at: DateTime<Utc>,
    },

    /// Failed or abandoned job was re-surfaced by the redelivery sweep
    Redelivered {
        job_ref: JobRef,
        namespace: String,
        attempts: u32,
        at: DateTime<Utc>,
    },

    /// A subscriber claimed the job
    Started {
        job_ref: JobRef,
        attempts: u32,
        at: DateTime<Utc>,
    },

    /// Handler reported success
    Completed {
        job_ref: JobRef,
        at: DateTime<Utc>,
    },

    /// Handler reported an error
    Failed {
        job_ref: JobRef,
        at: DateTime<Utc>,
    },

    /// Broker-wide error (tail failures, persistence failures)
    Error {
        message: String,
        at: DateTime<Utc>,
    },
}

impl BrokerEvent {
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Delivered { .. } => "delivered",
            Self::Redelivered { .. } => "redelivered",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Error { .. } => "error",
        }
    }

    /// Get the job ref, if the event concerns a single job
    pub fn job_ref(&self) -> Option<&JobRef> {
        match self {
            Self::Published { job_ref, .. }
            | Self::Delivered { job_ref, .. }
            | Self::Redelivered { job_ref, .. }
            | Self::Started { job_ref, .. }
            | Self::Completed { job_ref, .. }
            | Self::Failed { job_ref, .. } => Some(job_ref),
            Self::Error { .. } => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Published { at, .. }
            | Self::Delivered { at, .. }
            | Self::Redelivered { at, .. }
            | Self::Started { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Error { at, .. } => at,
        }
    }
}
