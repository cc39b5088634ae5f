//! # beacon-logging
//!
//! Structured logging with `tracing`.
//!
//! Hosts call [`init_from_settings`] (or [`init_subscriber`]) once at startup.
//! Tests use [`capture_logs`] to assert on emitted events without touching
//! the global subscriber.

#![deny(unsafe_code)]

pub mod test_utils;

use beacon_settings::LoggingSettings;
use tracing_subscriber::EnvFilter;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

/// Initialize the global tracing subscriber with compact stderr output.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Initialize the global tracing subscriber emitting one JSON object per line.
pub fn init_json_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

/// Initialize the global subscriber from loaded [`LoggingSettings`].
pub fn init_from_settings(settings: &LoggingSettings) {
    if settings.json {
        init_json_subscriber(&settings.level);
    } else {
        init_subscriber(&settings.level);
    }
}
