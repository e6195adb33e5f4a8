//! Per invocation logging.
//!
//! A subscriber is built from the configured level and installed only
//! while one invocation runs, nothing is registered process wide.

use crate::config::LogLevel;
use tracing::Subscriber;

/// JSON formatted subscriber writing to stdout. Timestamps are left out,
/// the Lambda log stream adds the ingestion time.
pub fn subscriber(level: LogLevel) -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .json()
        .with_max_level(level.as_filter())
        .with_target(false)
        .without_time()
        .finish()
}

/// Runs `f` with the subscriber for `level` as the default one on the
/// current thread.
pub fn with_invocation_logging<T>(level: LogLevel, f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(subscriber(level), f)
}
