//! Engine configuration, loadable from TOML.

use crate::cache::CachePolicy;
use crate::retry::{Delay, RetryPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// How unresolved `{{placeholders}}` are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderMode {
    /// Fail compilation on any unresolved placeholder.
    #[default]
    Strict,
    /// Leave unresolved placeholders in the text.
    Lenient,
}

/// What the loop does after a tool step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFailurePolicy {
    /// Record the failure in history and hand control back to the model.
    #[default]
    Recover,
    /// End the execution with the tool error.
    Abort,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on LLM and tool steps in one execution.
    pub max_iterations: u32,

    /// Messages of history shown to the model per turn.
    pub history_limit: usize,

    pub placeholders: PlaceholderMode,

    pub tool_failure: ToolFailurePolicy,

    /// Default retry policy for functions that do not declare one.
    pub retry: RetryConfig,

    /// Default cache policy for functions that do not declare one.
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            history_limit: 10,
            placeholders: PlaceholderMode::Strict,
            tool_failure: ToolFailurePolicy::Recover,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    /// Multiplier applied per retry; `1.0` means a fixed delay.
    pub backoff: f64,
    pub max_delay_ms: u64,
    /// Re-compile the prompt with the last parse/validation error on retry.
    pub validation_feedback: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
            backoff: 2.0,
            max_delay_ms: 5_000,
            validation_feedback: false,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Install an in-memory cache when the context has none.
    pub enabled: bool,
    pub ttl_secs: Option<u64>,
    /// Entry bound for the in-memory cache installed when none is supplied.
    pub capacity: usize,
    /// Period of the background sweep of expired in-memory entries.
    pub eviction_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: None,
            capacity: 256,
            eviction_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be at least 1".into()));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.backoff.is_finite() || self.retry.backoff < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff must be >= 1.0".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be at least 1".into()));
        }
        if self.cache.eviction_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.eviction_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The default retry policy described by `[retry]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.retry;
        let base = Duration::from_millis(retry.delay_ms);
        let delay = if retry.delay_ms == 0 {
            Delay::None
        } else if retry.backoff <= 1.0 {
            Delay::Fixed(base)
        } else {
            Delay::Exponential {
                base,
                factor: retry.backoff,
                max: Duration::from_millis(retry.max_delay_ms),
            }
        };
        RetryPolicy::new(retry.max_attempts)
            .with_delay(delay)
            .with_validation_feedback(retry.validation_feedback)
    }

    /// The default cache policy for functions that do not declare one.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: self.cache.ttl_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
