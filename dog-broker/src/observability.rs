//! Subscriber setup for binaries and tests embedding the broker.
//!
//! The broker itself only emits `tracing` events; installing a subscriber is
//! left to the application. These helpers cover the common case.

use tracing_subscriber::EnvFilter;

use crate::{BrokerError, BrokerResult};

fn filter(debug: bool) -> EnvFilter {
    let level = if debug { tracing::Level::DEBUG } else { tracing::Level::INFO };
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Install a plain-text global subscriber. `RUST_LOG` directives still apply.
pub fn init_tracing(debug: bool) -> BrokerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .try_init()
        .map_err(|e| BrokerError::configuration(format!("tracing subscriber: {}", e)))
}

/// Install a JSON global subscriber
pub fn init_json_tracing(debug: bool) -> BrokerResult<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(debug))
        .try_init()
        .map_err(|e| BrokerError::configuration(format!("tracing subscriber: {}", e)))
}
