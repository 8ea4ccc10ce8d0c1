//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML file
//! at `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon after loading)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! Every section is optional and every key inside a section is optional.
//!
//! # Example Configuration
//!
//! ```toml
//! follow_pressure = true
//!
//! [registry]
//! max_connections = 100
//! heartbeat_interval_secs = 30
//! stale_timeout_secs = 30
//!
//! [router]
//! session_timeout_secs = 1800
//!
//! [queue]
//! max_size = 500
//! confirmation_timeout_secs = 300
//!
//! [processor]
//! workers = 2
//! processing_timeout_secs = 30
//! failed_retention_secs = 3600
//!
//! [cache]
//! max_size = 1000
//! ttl_secs = 86400
//! similarity_threshold = 0.75
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 250
//!
//! [analyzer]
//! host = "127.0.0.1"
//! port = 11434
//! model = "llama3.2:1b"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::AnalyzerConfig;
use crate::cache::CacheConfig;
use crate::outbound::QueueConfig;
use crate::processor::ProcessorConfig;
use crate::registry::RegistryConfig;
use crate::retry::RetryPolicy;
use crate::session::RouterConfig;

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

// =============================================================================
// Configuration
// =============================================================================

/// Complete relay configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Degrade the cache on critical resource samples, restore on normal ones
    pub follow_pressure: bool,
    /// Connection registry
    pub registry: RegistryConfig,
    /// Session router
    pub router: RouterConfig,
    /// Outbound message queue
    pub queue: QueueConfig,
    /// Background task processor
    pub processor: ProcessorConfig,
    /// Similarity cache
    pub cache: CacheConfig,
    /// Retry policy shared by the processor and the message queue
    pub retry: RetryPolicy,
    /// Analysis engine
    pub analyzer: AnalyzerConfig,
}

impl RelayConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for malformed TOML or mistyped values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Check values that would make a component unusable
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::ValidationError(what.to_string()));

        if self.registry.max_connections == 0 {
            return invalid("registry.max_connections must be at least 1");
        }
        if self.registry.heartbeat_interval_secs == 0 {
            return invalid("registry.heartbeat_interval_secs must be at least 1");
        }
        if self.router.session_timeout_secs == 0 {
            return invalid("router.session_timeout_secs must be at least 1");
        }
        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be at least 1");
        }
        if self.processor.workers == 0 {
            return invalid("processor.workers must be at least 1");
        }
        if self.processor.processing_timeout_secs == 0 {
            return invalid("processor.processing_timeout_secs must be at least 1");
        }
        if self.processor.max_input_chars == 0 {
            return invalid("processor.max_input_chars must be at least 1");
        }
        if self.cache.max_size == 0 {
            return invalid("cache.max_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return invalid("cache.similarity_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.cache.degraded_threshold) {
            return invalid("cache.degraded_threshold must be within [0, 1]");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides from `lookup`
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(workers) = parsed(&lookup, "RELAY_WORKERS") {
            self.processor.workers = workers;
        }
        if let Some(max) = parsed(&lookup, "RELAY_MAX_CONNECTIONS") {
            self.registry.max_connections = max;
        }
        if let Some(secs) = parsed(&lookup, "RELAY_SESSION_TIMEOUT_SECS") {
            self.router.session_timeout_secs = secs;
        }
        if let Some(max) = parsed(&lookup, "RELAY_QUEUE_MAX") {
            self.queue.max_size = max;
        }
        if let Some(host) = lookup("OLLAMA_HOST").filter(|h| !h.trim().is_empty()) {
            self.analyzer.host = host;
        }
        if let Some(port) = parsed(&lookup, "OLLAMA_PORT") {
            self.analyzer.port = port;
        }
        if let Some(model) = lookup("RELAY_MODEL").filter(|m| !m.trim().is_empty()) {
            self.analyzer.model = model;
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result is invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed, or the
/// resulting configuration is invalid.
pub fn load_config_from_path(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let mut config = read_file(path)?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn read_file(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(RelayConfig::default());
    };
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(RelayConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let config = RelayConfig::from_toml(&content)?;
    tracing::info!(path = %path.display(), "Loaded configuration from file");
    Ok(config)
}
