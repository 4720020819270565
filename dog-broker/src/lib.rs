//! # dog-broker: Job Broker over Tailable Logs
//!
//! **Namespace routing, completion correlation and timeout redelivery on two capped logs**
//!
//! Producers publish opaque JSON payloads under a namespace. Every handler
//! subscribed to that namespace receives the job, reports an outcome through
//! [`Done`], and the producer's callback is invoked with it, correlated by the
//! job's ref. Jobs and completions live in durable, insertion-ordered logs;
//! live tail cursors on those logs drive delivery, so several brokers sharing
//! the same logs cooperate without any other coordination.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a job `started` longer than `retry_timeout` ago, or
//!   one that failed, is redelivered under the same ref by a periodic sweep.
//! - **No exclusivity**: all subscribers of a namespace receive every job.
//!   Handlers must be idempotent.
//! - **At-most-once callbacks**: a producer callback fires once, with the
//!   first completion observed for its ref or with the publish error.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_broker::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> BrokerResult<()> {
//! let source = MemorySource::new();
//! let broker = Broker::start(&source, BrokerConfig::default()).await?;
//!
//! broker.subscribe("jobs.double", |payload, done| async move {
//!     let n = payload["n"].as_i64().unwrap_or(0);
//!     let _ = done.ok(vec![json!(n * 2)]).await;
//! })?;
//!
//! let completion = broker.request("jobs.double", json!({ "n": 21 })).await?;
//! assert_eq!(completion.results(), &[json!(42)]);
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod log;
pub mod bus;
pub mod broker;
mod bridge;
mod redelivery;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use broker::{Broker, CompletionCallback, Done, JobHandle};
pub use bus::{EventBus, ListenerId};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use log::{DurableLog, LogRecord, LogSource, TailStream};
pub use log::memory::{MemoryLog, MemorySource};
pub use types::{
    BrokerEvent, Completion, CompletionFilter, CompletionRecord, JobFilter, JobRecord, JobRef,
    JobStatus, JobTransition, LogCapabilities,
};

/// Everything needed to run a broker
pub mod prelude {
    pub use crate::{
        Broker, BrokerConfig, BrokerError, BrokerEvent, BrokerResult, Completion, Done, JobHandle,
        JobRef, JobStatus,
    };

    // Storage
    pub use crate::{DurableLog, JobTransition, LogSource, MemoryLog, MemorySource};

    // Custom storage engines
    pub use async_trait::async_trait;
}
