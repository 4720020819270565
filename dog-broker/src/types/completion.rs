use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobRef;

/// Ref reserved for the readiness placeholder written into empty logs
pub const PLACEHOLDER_REF: &str = "$dog-broker.placeholder";

/// Completion record - written once per terminal transition, never updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Ref of the job this completion belongs to
    #[serde(rename = "ref")]
    pub job_ref: JobRef,

    /// `[error, ...results]` as reported by the handler
    pub params: Vec<Value>,
}

impl CompletionRecord {
    /// Build the record for a handler outcome. A missing error is stored as `null`.
    pub fn new(job_ref: JobRef, error: Option<Value>, results: Vec<Value>) -> Self {
        let mut params = Vec::with_capacity(results.len() + 1);
        params.push(error.unwrap_or(Value::Null));
        params.extend(results);

        Self { job_ref, params }
    }

    pub fn placeholder() -> Self {
        Self {
            job_ref: JobRef::from(PLACEHOLDER_REF),
            params: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.job_ref.as_str() == PLACEHOLDER_REF
    }

    pub fn matches(&self, filter: &CompletionFilter) -> bool {
        match filter {
            CompletionFilter::All => true,
            CompletionFilter::Ref(job_ref) => &self.job_ref == job_ref,
        }
    }
}

/// Query predicate over completion records
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CompletionFilter {
    #[default]
    All,
    Ref(JobRef),
}

/// Outcome handed to a producer's completion callback
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub job_ref: JobRef,
    pub params: Vec<Value>,
}

impl Completion {
    /// The error reported by the handler, if any
    pub fn error(&self) -> Option<&Value> {
        self.params.first().filter(|value| !value.is_null())
    }

    /// Everything the handler passed after the error slot
    pub fn results(&self) -> &[Value] {
        self.params.get(1..).unwrap_or(&[])
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }
}

impl From<CompletionRecord> for Completion {
    fn from(record: CompletionRecord) -> Self {
        Self {
            job_ref: record.job_ref,
            params: record.params,
        }
    }
}
