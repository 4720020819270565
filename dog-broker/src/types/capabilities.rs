use serde::{Deserialize, Serialize};

/// Features a broker cannot run without, in reporting order
pub const REQUIRED_FOR_BROKER: [&str; 3] = ["tail", "update_in_place", "replay_on_open"];

/// Log capabilities - explicit feature detection for storage engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCapabilities {
    /// Support for live tail cursors
    pub tail: bool,

    /// Support for replacing a stored record in place
    pub update_in_place: bool,

    /// Tail cursors first replay matching records already in the log
    pub replay_on_open: bool,

    /// Oldest records are evicted once the log is full
    pub capped: bool,
}

impl Default for LogCapabilities {
    fn default() -> Self {
        Self {
            tail: true,
            update_in_place: true,
            replay_on_open: true,
            capped: true,
        }
    }
}

impl LogCapabilities {
    /// Create capabilities with all features enabled
    pub fn all() -> Self {
        Self::default()
    }

    /// Create minimal capabilities (insert and query only)
    pub fn minimal() -> Self {
        Self {
            tail: false,
            update_in_place: false,
            replay_on_open: false,
            capped: false,
        }
    }

    /// Check if a specific feature is supported
    pub fn supports(&self, feature: &str) -> bool {
        match feature {
            "tail" => self.tail,
            "update_in_place" => self.update_in_place,
            "replay_on_open" => self.replay_on_open,
            "capped" => self.capped,
            _ => false,
        }
    }

    /// Required features this log lacks. Replay on open is what recovers
    /// still-`new` jobs after a restart or a tail reopen.
    pub fn missing_for_broker(&self) -> Vec<&'static str> {
        REQUIRED_FOR_BROKER
            .into_iter()
            .filter(|feature| !self.supports(feature))
            .collect()
    }
}
