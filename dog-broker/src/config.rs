use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{BrokerError, BrokerResult};

/// Default job collection name
pub const DEFAULT_JOB_COLLECTION: &str = "dog_broker_jobs";

/// Default completion collection name
pub const DEFAULT_COMPLETION_COLLECTION: &str = "dog_broker_completions";

/// Broker configuration. Immutable once handed to [`crate::Broker::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Name of the job log
    pub job_collection: String,
    /// Name of the completion log
    pub completion_collection: String,
    /// Emit per-job debug logging
    pub debug: bool,
    /// How long a `started` job may run before it is considered abandoned
    pub retry_timeout: Duration,
    /// How often the redelivery sweep runs
    pub redelivery_interval: Duration,
    /// Stop redelivering a job once it has been started this many times
    pub max_attempts: Option<u32>,
    /// Buffer size of the broker event channel
    pub event_capacity: usize,
    /// Consecutive attempts to reopen a failed tail before giving up
    pub tail_reopen_attempts: u32,
    /// Initial delay between tail reopen attempts
    pub tail_reopen_backoff: Duration,
    /// Upper bound on the tail reopen delay
    pub max_tail_reopen_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            job_collection: DEFAULT_JOB_COLLECTION.to_string(),
            completion_collection: DEFAULT_COMPLETION_COLLECTION.to_string(),
            debug: false,
            retry_timeout: Duration::from_secs(15 * 60),
            redelivery_interval: Duration::from_secs(30),
            max_attempts: None,
            event_capacity: 1000,
            tail_reopen_attempts: 5,
            tail_reopen_backoff: Duration::from_secs(1),
            max_tail_reopen_backoff: Duration::from_secs(60),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `DOG_BROKER_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults:
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `DOG_BROKER_JOB_COLLECTION` | `job_collection` |
    /// | `DOG_BROKER_COMPLETION_COLLECTION` | `completion_collection` |
    /// | `DOG_BROKER_DEBUG` | `debug` |
    /// | `DOG_BROKER_RETRY_TIMEOUT_MINUTES` | `retry_timeout` |
    /// | `DOG_BROKER_REDELIVERY_INTERVAL_SECS` | `redelivery_interval` |
    /// | `DOG_BROKER_MAX_ATTEMPTS` | `max_attempts` |
    /// | `DOG_BROKER_EVENT_CAPACITY` | `event_capacity` |
    /// | `DOG_BROKER_TAIL_REOPEN_ATTEMPTS` | `tail_reopen_attempts` |
    /// | `DOG_BROKER_TAIL_REOPEN_BACKOFF_MS` | `tail_reopen_backoff` |
    /// | `DOG_BROKER_MAX_TAIL_REOPEN_BACKOFF_SECS` | `max_tail_reopen_backoff` |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            job_collection: env::var("DOG_BROKER_JOB_COLLECTION").unwrap_or(defaults.job_collection),
            completion_collection: env::var("DOG_BROKER_COMPLETION_COLLECTION")
                .unwrap_or(defaults.completion_collection),
            debug: env_parse("DOG_BROKER_DEBUG", defaults.debug),
            retry_timeout: env_value::<f64>("DOG_BROKER_RETRY_TIMEOUT_MINUTES")
                .map(minutes)
                .unwrap_or(defaults.retry_timeout),
            redelivery_interval: Duration::from_secs(env_parse(
                "DOG_BROKER_REDELIVERY_INTERVAL_SECS",
                defaults.redelivery_interval.as_secs(),
            )),
            max_attempts: env_value("DOG_BROKER_MAX_ATTEMPTS").or(defaults.max_attempts),
            event_capacity: env_parse("DOG_BROKER_EVENT_CAPACITY", defaults.event_capacity),
            tail_reopen_attempts: env_parse("DOG_BROKER_TAIL_REOPEN_ATTEMPTS", defaults.tail_reopen_attempts),
            tail_reopen_backoff: Duration::from_millis(env_parse(
                "DOG_BROKER_TAIL_REOPEN_BACKOFF_MS",
                defaults.tail_reopen_backoff.as_millis() as u64,
            )),
            max_tail_reopen_backoff: Duration::from_secs(env_parse(
                "DOG_BROKER_MAX_TAIL_REOPEN_BACKOFF_SECS",
                defaults.max_tail_reopen_backoff.as_secs(),
            )),
        }
    }

    pub fn with_job_collection(mut self, name: impl Into<String>) -> Self {
        self.job_collection = name.into();
        self
    }

    pub fn with_completion_collection(mut self, name: impl Into<String>) -> Self {
        self.completion_collection = name.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Set the abandonment timeout in (possibly fractional) minutes
    pub fn with_retry_timeout_minutes(mut self, value: f64) -> Self {
        self.retry_timeout = minutes(value);
        self
    }

    pub fn with_redelivery_interval(mut self, interval: Duration) -> Self {
        self.redelivery_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Configure tail reopen attempts and the backoff window
    pub fn with_tail_reopen(mut self, attempts: u32, backoff: Duration, max_backoff: Duration) -> Self {
        self.tail_reopen_attempts = attempts;
        self.tail_reopen_backoff = backoff;
        self.max_tail_reopen_backoff = max_backoff;
        self
    }

    /// Check the configuration before a broker is started
    pub fn validate(&self) -> BrokerResult<()> {
        if self.job_collection.trim().is_empty() {
            return Err(BrokerError::configuration("job_collection must not be empty"));
        }
        if self.completion_collection.trim().is_empty() {
            return Err(BrokerError::configuration("completion_collection must not be empty"));
        }
        if self.job_collection == self.completion_collection {
            return Err(BrokerError::configuration(
                "job_collection and completion_collection must differ",
            ));
        }
        if self.event_capacity == 0 {
            return Err(BrokerError::configuration("event_capacity must be greater than zero"));
        }
        if self.redelivery_interval.is_zero() {
            return Err(BrokerError::configuration("redelivery_interval must be greater than zero"));
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_value(key).unwrap_or(default)
}

// Negative and non-finite inputs collapse to zero
fn minutes(value: f64) -> Duration {
    Duration::try_from_secs_f64(value * 60.0).unwrap_or(Duration::ZERO)
}
