//! Logging subsystem for relaymesh
//!
//! Thin wrapper over `tracing-subscriber`: an `EnvFilter` (honouring
//! `RUST_LOG` when set) plus a text or JSON formatting layer.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

mod level;

pub use level::LogLevel;

/// Errors that can occur in the logging subsystem
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),
    #[error("Invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self { level, ..Default::default() }
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(section: &LoggingConfig) -> Result<Self, Self::Error> {
        Ok(LogConfig::new(section.level.parse()?)
            .with_timestamp(section.with_timestamp)
            .with_target(section.with_target)
            .json_format(section.json_format))
    }
}

fn format_layer(config: &LogConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer().with_target(config.with_target);
    match (config.json_format, config.with_timestamp) {
        (true, true) => base.json().boxed(),
        (true, false) => base.json().without_time().boxed(),
        (false, true) => base.boxed(),
        (false, false) => base.without_time().boxed(),
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
///
/// # Example
/// ```
/// use relaymesh_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug).with_target(false);
/// init_logging_with_config(config).expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    tracing_subscriber::registry()
        .with(format_layer(&config))
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

/// Install the global subscriber with default formatting at `level`
pub fn init_logging(level: LogLevel) -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::new(level))
}

/// Install the global subscriber from the `[logging]` config section
pub fn init_from_config(section: &LoggingConfig) -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::try_from(section)?)
}
