//! # Server Configuration Module
//!
//! Configuration is resolved from (in order of precedence):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. `config.json` in the configuration directory (log level and per-user
//!    log overrides)
//! 4. Default values
//!
//! The JSON file is also re-read by the `/log` endpoint so override edits take
//! effect without a restart.

use crate::error::{EncrypterError, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{metadata::ParseLevelError, Level};

/// Name of the JSON file looked up inside the configuration directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Wrapper for `tracing::Level` to handle serialization/deserialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevel(Level);

impl LogLevel {
    /// Returns the inner `tracing::Level` value.
    #[must_use]
    pub fn inner(&self) -> Level {
        self.0
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        Self(level)
    }
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        log_level.0
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string().to_lowercase())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s.parse().map_err(serde::de::Error::custom)?))
    }
}

/// Per-user log level override from `config.json`.
///
/// ```json
/// { "overrides": { "user": "alice", "loglevel": "debug" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOverride {
    /// User id the override applies to
    pub user: String,
    /// Level to use for that user's requests
    #[serde(rename = "loglevel")]
    pub log_level: Option<LogLevel>,
}

impl LogOverride {
    /// Level to apply for `user`, or `None` when the base level stands.
    ///
    /// The override applies only to the named user, and only when it names a
    /// level different from `base`.
    #[must_use]
    pub fn level_for(&self, base: Level, user: &str) -> Option<Level> {
        if self.user != user {
            return None;
        }
        match self.log_level {
            Some(level) if level.inner() != base => Some(level.inner()),
            _ => None,
        }
    }
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    /// Base log level used when none is given on the command line
    pub log_level: Option<LogLevel>,
    /// Optional per-user override
    pub overrides: Option<LogOverride>,
}

impl FileConfig {
    /// Read `config.json` from `dir`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file is
    /// an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EncrypterError::config_error(
                format!("Failed to read {}: {e}", path.display()),
                Some(Box::new(e)),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EncrypterError::config_error(
                format!("Invalid config file {}: {e}", path.display()),
                Some(Box::new(e)),
            )
        })
    }
}

/// Server and pipeline configuration
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "batch-encrypter",
    about = "Bounded-concurrency batch encrypt-and-sign service",
    version,
    long_about = None
)]
pub struct ServerConfig {
    /// Network address to bind the server to
    #[arg(
        short = 'b',
        long = "bind",
        value_name = "ADDRESS:PORT",
        default_value = "0.0.0.0:9090",
        env = "ENCRYPTER_BIND_ADDR",
        help = "Network address to bind the server to"
    )]
    pub bind_addr: SocketAddr,

    /// Optional RSA private key in PEM format
    ///
    /// When absent a fresh key pair is generated at start-up.
    #[arg(
        short = 'k',
        long = "rsa-key",
        value_name = "PATH",
        env = "RSA_PRIVATE_KEY_PATH",
        help = "Path to an RSA private key (PEM); generated at start-up when omitted"
    )]
    pub rsa_private_key_path: Option<PathBuf>,

    /// Modulus size of the generated RSA key pair
    #[arg(
        long = "rsa-key-bits",
        value_name = "BITS",
        default_value_t = crate::DEFAULT_RSA_KEY_BITS,
        env = "RSA_KEY_BITS",
        help = "Size in bits of the generated RSA key"
    )]
    pub rsa_key_bits: usize,

    /// Logging level; falls back to `config.json`, then INFO
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "LOG_LEVEL",
        help = "Logging level (error, warn, info, debug, trace)"
    )]
    pub log_level: Option<LogLevel>,

    /// Directory holding `config.json`
    #[arg(
        long = "config-path",
        value_name = "DIR",
        default_value = "./config",
        env = "CONFIG_PATH",
        help = "Directory containing config.json"
    )]
    pub config_path: PathBuf,

    /// Maximum number of messages encrypted at the same time
    #[arg(
        short = 'c',
        long = "concurrency-limit",
        value_name = "COUNT",
        default_value_t = crate::DEFAULT_CONCURRENCY_LIMIT,
        env = "CONCURRENCY_LIMIT",
        help = "Maximum simultaneous encrypt-and-sign operations per batch"
    )]
    pub concurrency_limit: usize,

    /// Optional per-message timeout in milliseconds
    #[arg(
        long = "task-timeout",
        value_name = "MILLISECONDS",
        env = "TASK_TIMEOUT_MS",
        help = "Fail a single message after this long instead of waiting indefinitely"
    )]
    pub task_timeout_ms: Option<u64>,

    /// Use the mock capability instead of real cryptography
    #[arg(
        long = "mock",
        env = "ENCRYPTER_MOCK",
        help = "Replace encryption with a fixed-delay mock"
    )]
    pub mock: bool,

    /// Simulated latency of the mock capability
    #[arg(
        long = "mock-delay",
        value_name = "MILLISECONDS",
        default_value_t = 1000,
        env = "MOCK_DELAY_MS",
        help = "Per-message delay of the mock capability"
    )]
    pub mock_delay_ms: u64,

    /// Maximum request payload size in bytes
    #[arg(
        short = 'm',
        long = "max-payload-size",
        value_name = "BYTES",
        default_value_t = crate::MAX_PAYLOAD_SIZE,
        env = "MAX_PAYLOAD_SIZE",
        help = "Maximum request payload size in bytes"
    )]
    pub max_payload_size: usize,

    /// How long shutdown waits for open connections
    #[arg(
        long = "graceful-timeout",
        value_name = "SECONDS",
        default_value_t = crate::GRACEFUL_TIMEOUT_SECS,
        env = "GRACEFUL_TIMEOUT_SECS",
        help = "Seconds to wait for in-flight requests on shutdown"
    )]
    pub graceful_timeout_secs: u64,

    /// Number of Tokio worker threads
    #[arg(
        short = 'w',
        long = "worker-threads",
        value_name = "COUNT",
        env = "WORKER_THREADS",
        help = "Number of worker threads (default: 2x CPU cores, max 16)"
    )]
    pub worker_threads: Option<usize>,

    /// Enable Prometheus metrics endpoint
    #[arg(
        long = "enable-metrics",
        env = "ENABLE_METRICS",
        help = "Enable Prometheus metrics endpoint"
    )]
    pub enable_metrics: bool,

    /// Enable health check endpoint
    #[arg(
        long = "enable-health-check",
        env = "ENABLE_HEALTH_CHECK",
        default_value = "true",
        action = clap::ArgAction::Set,
        help = "Enable health check endpoint"
    )]
    pub enable_health_check: bool,
}

impl ServerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from command-line arguments and environment
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Load configuration from environment variables only
    ///
    /// Missing variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("ENCRYPTER_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Ok(key_path) = std::env::var("RSA_PRIVATE_KEY_PATH") {
            config.rsa_private_key_path = Some(PathBuf::from(key_path));
        }
        if let Some(bits) = env_parse("RSA_KEY_BITS")? {
            config.rsa_key_bits = bits;
        }
        if let Some(level) = env_parse::<LogLevel>("LOG_LEVEL")? {
            config.log_level = Some(level);
        }
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            config.config_path = PathBuf::from(path);
        }
        if let Some(limit) = env_parse("CONCURRENCY_LIMIT")? {
            config.concurrency_limit = limit;
        }
        if let Some(timeout) = env_parse("TASK_TIMEOUT_MS")? {
            config.task_timeout_ms = Some(timeout);
        }
        if let Some(mock) = env_parse("ENCRYPTER_MOCK")? {
            config.mock = mock;
        }
        if let Some(delay) = env_parse("MOCK_DELAY_MS")? {
            config.mock_delay_ms = delay;
        }
        if let Some(size) = env_parse("MAX_PAYLOAD_SIZE")? {
            config.max_payload_size = size;
        }
        if let Some(secs) = env_parse("GRACEFUL_TIMEOUT_SECS")? {
            config.graceful_timeout_secs = secs;
        }
        if let Some(workers) = env_parse("WORKER_THREADS")? {
            config.worker_threads = Some(workers);
        }
        if let Some(metrics) = env_parse("ENABLE_METRICS")? {
            config.enable_metrics = metrics;
        }
        if let Some(health) = env_parse("ENABLE_HEALTH_CHECK")? {
            config.enable_health_check = health;
        }

        Ok(config)
    }

    /// Validate the configuration for consistency and security
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if validation fails
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.ip().is_unspecified() {
            tracing::warn!(
                "Binding to wildcard address {} - ensure this is secure for your environment",
                self.bind_addr
            );
        }

        if self.concurrency_limit == 0 {
            return Err(EncrypterError::config_error(
                "Concurrency limit must be at least 1",
                None,
            ));
        }

        if !self.mock && self.rsa_private_key_path.is_none() && self.rsa_key_bits < crate::MIN_RSA_KEY_SIZE {
            return Err(EncrypterError::config_error(
                format!(
                    "RSA key size {} is below the minimum of {}",
                    self.rsa_key_bits,
                    crate::MIN_RSA_KEY_SIZE
                ),
                None,
            ));
        }

        if let Some(path) = &self.rsa_private_key_path {
            if !path.is_file() {
                return Err(EncrypterError::config_error(
                    format!("RSA private key file does not exist: {}", path.display()),
                    None,
                ));
            }
        }

        if self.max_payload_size == 0 {
            return Err(EncrypterError::config_error(
                "Maximum payload size cannot be zero",
                None,
            ));
        }

        if self.task_timeout_ms == Some(0) {
            return Err(EncrypterError::config_error(
                "Task timeout cannot be zero",
                None,
            ));
        }

        if let Some(workers) = self.worker_threads {
            if workers == 0 {
                return Err(EncrypterError::config_error(
                    "Worker thread count cannot be zero",
                    None,
                ));
            }

            if workers > 64 {
                tracing::warn!(
                    "Very high worker thread count: {} - this may cause excessive context switching",
                    workers
                );
            }
        }

        Ok(())
    }

    /// Get the number of worker threads to run
    ///
    /// Defaults to twice the CPU count, capped at 16.
    #[must_use]
    pub fn get_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4)
                .min(16)
        })
    }

    /// Per-task timeout as a `Duration`.
    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Mock capability delay as a `Duration`.
    #[must_use]
    pub fn mock_delay(&self) -> Duration {
        Duration::from_millis(self.mock_delay_ms)
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    /// Read `config.json` from the configured directory.
    pub fn load_file_config(&self) -> Result<FileConfig> {
        FileConfig::load(&self.config_path)
    }

    /// Effective base log level: command line or environment, then the
    /// config file, then INFO.
    #[must_use]
    pub fn resolved_log_level(&self, file: &FileConfig) -> Level {
        self.log_level
            .or(file.log_level)
            .map_or(Level::INFO, |level| level.inner())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(crate::DEFAULT_BIND_ADDR, crate::DEFAULT_PORT),
            rsa_private_key_path: None,
            rsa_key_bits: crate::DEFAULT_RSA_KEY_BITS,
            log_level: None,
            config_path: PathBuf::from("./config"),
            concurrency_limit: crate::DEFAULT_CONCURRENCY_LIMIT,
            task_timeout_ms: None,
            mock: false,
            mock_delay_ms: 1000,
            max_payload_size: crate::MAX_PAYLOAD_SIZE,
            graceful_timeout_secs: crate::GRACEFUL_TIMEOUT_SECS,
            worker_threads: None,
            enable_metrics: false,
            enable_health_check: true,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|e| {
            EncrypterError::config_error(format!("Invalid {name} '{raw}': {e}"), Some(Box::new(e)))
        }),
        Err(_) => Ok(None),
    }
}
