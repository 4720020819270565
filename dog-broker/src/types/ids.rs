use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation reference assigned to a job at creation
///
/// Refs are never reused: every published job gets a fresh v4 UUID and
/// completions find their producer through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRef(pub String);

impl JobRef {
    /// Generate a new unique job ref
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a job ref from a string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
