//! TOML Configuration File Support
//!
//! Tunables of the [`Manager`](crate::Manager), loaded from an optional TOML
//! file at `~/.config/logstream/logstream.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`LOGSTREAM_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [output]
//! capacity = 256
//!
//! [streams]
//! max_concurrent_per_session = 20
//! max_line_bytes = 1048576
//!
//! [reconnect]
//! max_attempts = 5
//! initial_backoff_ms = 1000
//! max_backoff_ms = 30000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::{Backoff, ReconnectPolicy};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Output section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToml {
    /// Capacity of the shared output channel
    pub capacity: Option<usize>,
}

/// Streams section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsToml {
    /// Simultaneous per-source streams per session
    pub max_concurrent_per_session: Option<usize>,
    /// Longest accepted line in bytes
    pub max_line_bytes: Option<usize>,
}

/// Reconnect section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectToml {
    /// Retries after the first attempt
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds
    pub initial_backoff_ms: Option<u64>,
    /// Backoff cap in milliseconds
    pub max_backoff_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogstreamToml {
    /// Output channel section
    pub output: OutputToml,
    /// Per-source stream section
    pub streams: StreamsToml,
    /// Reconnect section
    pub reconnect: ReconnectToml,
}

// =============================================================================
// Manager Configuration
// =============================================================================

/// Tunables of a [`Manager`](crate::Manager)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Capacity of the shared output channel
    pub output_capacity: usize,

    /// Simultaneous per-source streams per session
    pub max_concurrent_streams_per_session: usize,

    /// Retries after the first attempt before a source is given up
    pub reconnect_max_attempts: u32,

    /// First backoff delay
    pub initial_backoff: Duration,

    /// Backoff cap
    pub max_backoff: Duration,

    /// Longest accepted line in bytes
    pub max_line_bytes: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            output_capacity: 256,
            max_concurrent_streams_per_session: 20,
            reconnect_max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_line_bytes: 1024 * 1024,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reconnect policy derived from the backoff settings
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            backoff: Backoff::new(self.initial_backoff, self.max_backoff),
        }
    }

    /// Check the configuration for unusable values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for zero capacities or an
    /// initial backoff above the cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "output capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_streams_per_session == 0 {
            return Err(ConfigError::ValidationError(
                "max concurrent streams per session must be greater than zero".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max line bytes must be greater than zero".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::ValidationError(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/logstream/logstream.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("logstream").join("logstream.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// result does not validate. A missing config file is not an error.
pub fn load_config() -> Result<ManagerConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the result does not validate.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ManagerConfig, ConfigError> {
    let mut config = ManagerConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: LogstreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |name| std::env::var(name).ok());
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut ManagerConfig, toml: &LogstreamToml) {
    if let Some(capacity) = toml.output.capacity {
        config.output_capacity = capacity;
    }
    if let Some(max) = toml.streams.max_concurrent_per_session {
        config.max_concurrent_streams_per_session = max;
    }
    if let Some(bytes) = toml.streams.max_line_bytes {
        config.max_line_bytes = bytes;
    }
    if let Some(attempts) = toml.reconnect.max_attempts {
        config.reconnect_max_attempts = attempts;
    }
    if let Some(ms) = toml.reconnect.initial_backoff_ms {
        config.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.reconnect.max_backoff_ms {
        config.max_backoff = Duration::from_millis(ms);
    }
}

/// Apply `LOGSTREAM_*` variables; unparsable values are ignored
fn apply_env_config(config: &mut ManagerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("LOGSTREAM_OUTPUT_CAPACITY").and_then(|v| v.parse().ok()) {
        config.output_capacity = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = var("LOGSTREAM_MAX_CONCURRENT_STREAMS").and_then(|v| v.parse().ok()) {
        config.max_concurrent_streams_per_session = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = var("LOGSTREAM_MAX_LINE_BYTES").and_then(|v| v.parse().ok()) {
        config.max_line_bytes = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = var("LOGSTREAM_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.reconnect_max_attempts = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = var("LOGSTREAM_INITIAL_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        config.initial_backoff = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = var("LOGSTREAM_MAX_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        config.max_backoff = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Output channel capacity override
    pub output_capacity: Option<usize>,
    /// Per-session concurrency override
    pub max_concurrent_streams_per_session: Option<usize>,
    /// Reconnect attempts override
    pub reconnect_max_attempts: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set output capacity override
    #[must_use]
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = Some(capacity);
        self
    }

    /// Set per-session concurrency override
    #[must_use]
    pub fn with_max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams_per_session = Some(max);
        self
    }

    /// Set reconnect attempts override
    #[must_use]
    pub fn with_reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output_capacity.is_none()
            && self.max_concurrent_streams_per_session.is_none()
            && self.reconnect_max_attempts.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ManagerConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(capacity) = self.output_capacity {
            config.output_capacity = capacity;
        }
        if let Some(max) = self.max_concurrent_streams_per_session {
            config.max_concurrent_streams_per_session = max;
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            config.reconnect_max_attempts = attempts;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
