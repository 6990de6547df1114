//! Configuration management for relaymesh
//!
//! Configuration is read from a TOML file and/or `RELAYMESH_*` environment
//! variables. Every section has defaults, so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,

    /// Exit node selection and health probing
    pub exit_nodes: ExitNodeConfig,

    /// Client/site peer reconciliation
    pub reconciler: ReconcilerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of a counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Requests allowed per client per window
    pub max_requests: u64,

    /// Requests allowed per client and message type per window
    pub message_type_limit: u64,

    /// Pending increments that trigger a write-back to the shared store
    pub sync_threshold: u64,

    /// Interval of the forced write-back of all pending increments
    #[serde(with = "humantime_serde")]
    pub force_sync_interval: Duration,

    /// Extra lifetime of shared-store keys beyond the window
    #[serde(with = "humantime_serde")]
    pub key_ttl_grace: Duration,
}

/// Exit node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitNodeConfig {
    /// Region of this control plane; shared nodes must match it or be regionless
    pub region: Option<String>,

    /// Capacity weight below which a node counts as overloaded
    pub min_capacity_weight: f64,

    /// Absolute latency slack granted to a previously connected node (ms)
    pub latency_tolerance_ms: f64,

    /// Relative latency slack granted to a previously connected node
    pub latency_tolerance_ratio: f64,

    /// Parallel attempts per online probe
    pub probe_attempts: usize,

    /// Delay between the start of consecutive probe attempts
    #[serde(with = "humantime_serde")]
    pub probe_stagger: Duration,

    /// Timeout of a single probe attempt
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Timeout of calls to an exit node's HTTP API
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Interval of the background online check of every exit node
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
}

/// How new client/site associations reach each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayStrategy {
    /// Always route through the site's exit node relay port
    #[default]
    AlwaysRelay,
    /// Use the site's direct endpoint when it has one
    PreferDirect,
}

impl RelayStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStrategy::AlwaysRelay => "always-relay",
            RelayStrategy::PreferDirect => "prefer-direct",
        }
    }
}

impl fmt::Display for RelayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always-relay" | "relay" => Ok(RelayStrategy::AlwaysRelay),
            "prefer-direct" | "direct" => Ok(RelayStrategy::PreferDirect),
            other => Err(format!("unknown relay strategy '{}'", other)),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Endpoint policy for newly added associations
    pub relay_strategy: RelayStrategy,

    /// Relay port exposed by exit nodes
    pub relay_port: u16,

    /// Timeout of a single peer RPC
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,

    /// Exporter bind address
    pub bind_address: SocketAddr,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            message_type_limit: 20,
            sync_threshold: 15,
            force_sync_interval: Duration::from_secs(30),
            key_ttl_grace: Duration::from_secs(10),
        }
    }
}

impl Default for ExitNodeConfig {
    fn default() -> Self {
        Self {
            region: None,
            min_capacity_weight: 0.1,
            latency_tolerance_ms: 30.0,
            latency_tolerance_ratio: 0.15,
            probe_attempts: 3,
            probe_stagger: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            relay_strategy: RelayStrategy::AlwaysRelay,
            relay_port: 21820,
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::env(var, e))
}

fn parse_env_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| ConfigError::env(var, e))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: RELAYMESH_<SECTION>_<KEY>
    /// Example: RELAYMESH_RATE_LIMIT_MAX_REQUESTS=250
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Overlay process environment variables on this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    /// Overlay variables from an arbitrary lookup on this configuration
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const WINDOW: &str = "RELAYMESH_RATE_LIMIT_WINDOW";
        const MAX_REQUESTS: &str = "RELAYMESH_RATE_LIMIT_MAX_REQUESTS";
        const TYPE_LIMIT: &str = "RELAYMESH_RATE_LIMIT_MESSAGE_TYPE_LIMIT";
        const SYNC_THRESHOLD: &str = "RELAYMESH_RATE_LIMIT_SYNC_THRESHOLD";
        const REGION: &str = "RELAYMESH_EXIT_NODES_REGION";
        const RELAY_STRATEGY: &str = "RELAYMESH_RECONCILER_RELAY_STRATEGY";
        const RELAY_PORT: &str = "RELAYMESH_RECONCILER_RELAY_PORT";
        const RPC_TIMEOUT: &str = "RELAYMESH_RECONCILER_RPC_TIMEOUT";
        const LOG_LEVEL: &str = "RELAYMESH_LOG_LEVEL";
        const LOG_JSON: &str = "RELAYMESH_LOG_JSON";
        const METRICS_ENABLED: &str = "RELAYMESH_METRICS_ENABLED";
        const METRICS_ADDR: &str = "RELAYMESH_METRICS_BIND_ADDRESS";

        // Rate limit config
        if let Some(v) = lookup(WINDOW) {
            self.rate_limit.window = parse_env_duration(WINDOW, &v)?;
        }
        if let Some(v) = lookup(MAX_REQUESTS) {
            self.rate_limit.max_requests = parse_env(MAX_REQUESTS, &v)?;
        }
        if let Some(v) = lookup(TYPE_LIMIT) {
            self.rate_limit.message_type_limit = parse_env(TYPE_LIMIT, &v)?;
        }
        if let Some(v) = lookup(SYNC_THRESHOLD) {
            self.rate_limit.sync_threshold = parse_env(SYNC_THRESHOLD, &v)?;
        }

        // Exit node config
        if let Some(v) = lookup(REGION) {
            self.exit_nodes.region = if v.is_empty() { None } else { Some(v) };
        }

        // Reconciler config
        if let Some(v) = lookup(RELAY_STRATEGY) {
            self.reconciler.relay_strategy = parse_env(RELAY_STRATEGY, &v)?;
        }
        if let Some(v) = lookup(RELAY_PORT) {
            self.reconciler.relay_port = parse_env(RELAY_PORT, &v)?;
        }
        if let Some(v) = lookup(RPC_TIMEOUT) {
            self.reconciler.rpc_timeout = parse_env_duration(RPC_TIMEOUT, &v)?;
        }

        // Logging config
        if let Some(v) = lookup(LOG_LEVEL) {
            self.logging.level = v;
        }
        if let Some(v) = lookup(LOG_JSON) {
            self.logging.json_format = parse_env(LOG_JSON, &v)?;
        }

        // Metrics config
        if let Some(v) = lookup(METRICS_ENABLED) {
            self.metrics.enabled = parse_env(METRICS_ENABLED, &v)?;
        }
        if let Some(v) = lookup(METRICS_ADDR) {
            self.metrics.bind_address = parse_env(METRICS_ADDR, &v)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.window must be greater than 0".to_string(),
            ));
        }
        if rl.max_requests == 0 || rl.message_type_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate limits must be greater than 0".to_string(),
            ));
        }
        if rl.sync_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.sync_threshold must be greater than 0".to_string(),
            ));
        }
        if rl.force_sync_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.force_sync_interval must be greater than 0".to_string(),
            ));
        }

        let exit = &self.exit_nodes;
        if !(exit.min_capacity_weight > 0.0 && exit.min_capacity_weight <= 1.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "exit_nodes.min_capacity_weight must be in (0, 1], got {}",
                exit.min_capacity_weight
            )));
        }
        if exit.latency_tolerance_ms < 0.0 || exit.latency_tolerance_ratio < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "latency tolerances must not be negative".to_string(),
            ));
        }
        if exit.health_check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "exit_nodes.health_check_interval must be greater than 0".to_string(),
            ));
        }
        if exit.probe_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "exit_nodes.probe_attempts must be greater than 0".to_string(),
            ));
        }

        if self.reconciler.rpc_timeout.is_zero() || exit.rpc_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rpc timeouts must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
