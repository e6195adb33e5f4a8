//! Job configuration, read from the environment once at startup.

use std::num::{NonZeroU32, NonZeroUsize};
use std::str::FromStr;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

static DEFAULT_NAMESPACE: &str = "Custom/Lambda";
// PutMetricData accepts at most 1000 data points per request.
const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} must be a positive integer, got {value:?}")]
    NotPositive { name: &'static str, value: String },
}

/// Logging verbosity. Unset or unknown values fall back to `Error`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl LogLevel {
    pub fn parse_or_default(value: Option<&str>) -> LogLevel {
        value
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// `Critical` has no tracing counterpart and maps to `ERROR`.
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// `MaxItems` sent with every listing call.
    pub page_size: i32,
    pub log_level: LogLevel,
    pub namespace: String,
    pub metric_batch_size: NonZeroUsize,
    /// Attempts per AWS call, including the first one.
    pub max_attempts: NonZeroU32,
}

impl MonitorConfig {
    /// Reads `PAGE_SIZE` (required), `LOG_LEVEL`, `METRIC_NAMESPACE`,
    /// `METRIC_BATCH_SIZE` and `MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        MonitorConfig::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_page_size = lookup("PAGE_SIZE").ok_or(ConfigError::Missing("PAGE_SIZE"))?;
        let page_size = positive::<NonZeroU32>("PAGE_SIZE", &raw_page_size)?;
        let page_size = i32::try_from(page_size.get())
            .map_err(|_| invalid("PAGE_SIZE", &raw_page_size))?;

        let metric_batch_size = positive::<NonZeroUsize>(
            "METRIC_BATCH_SIZE",
            &lookup("METRIC_BATCH_SIZE").unwrap_or_else(|| DEFAULT_METRIC_BATCH_SIZE.to_string()),
        )?;

        let max_attempts = positive::<NonZeroU32>(
            "MAX_ATTEMPTS",
            &lookup("MAX_ATTEMPTS").unwrap_or_else(|| DEFAULT_MAX_ATTEMPTS.to_string()),
        )?;

        Ok(MonitorConfig {
            page_size,
            log_level: LogLevel::parse_or_default(lookup("LOG_LEVEL").as_deref()),
            namespace: lookup("METRIC_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            metric_batch_size,
            max_attempts,
        })
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::NotPositive {
        name,
        value: value.to_string(),
    }
}

// Zero is rejected by the `NonZero*` parsers.
fn positive<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| invalid(name, value))
}
