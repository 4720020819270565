use thiserror::Error;

use crate::types::JobStatus;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by the broker and its storage collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Log '{log}' does not support: {feature}")]
    BackendUnsupported { log: String, feature: String },

    #[error("Record not found in log '{log}': {key}")]
    RecordNotFound { log: String, key: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Cannot open a tail cursor on empty log '{0}'")]
    EmptyLog(String),

    #[error("Tail cursor on log '{log}' skipped {skipped} records")]
    TailLagged { log: String, skipped: u64 },

    #[error("Tail cursor on log '{0}' closed")]
    TailClosed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Broker shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether a tail reporting this error can be reopened
    pub fn is_tail_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TailLagged { .. } | Self::TailClosed(_) | Self::Storage(_) | Self::EmptyLog(_)
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
