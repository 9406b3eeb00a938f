// src/infra/config.rs — Configuration loading (TOML)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetLimit;
use crate::infra::errors::OracularError;
use crate::oracle::resilience::RetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, OracularError> {
        toml::from_str(text).map_err(|e| OracularError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OracularError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

/// Settings for the bundled HTTP transport. The engine itself only needs an
/// `Oracle` value; these exist so a caller can wire one up from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub default_model: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            default_model: None,
        }
    }
}

/// Ceilings per budget category. A missing value means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_requests: Option<f64>,
    pub max_completions: Option<f64>,
    pub max_input_tokens: Option<f64>,
    pub max_cached_input_tokens: Option<f64>,
    pub max_output_tokens: Option<f64>,
    pub max_cost_usd: Option<f64>,
}

impl BudgetConfig {
    pub fn limit(&self) -> BudgetLimit {
        BudgetLimit {
            requests: self.max_requests,
            completions: self.max_completions,
            input_tokens: self.max_input_tokens,
            cached_input_tokens: self.max_cached_input_tokens,
            output_tokens: self.max_output_tokens,
            cost_usd: self.max_cost_usd,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Corrective re-queries allowed per effect resolution.
    pub max_corrective_cycles: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_corrective_cycles: 3,
        }
    }
}

/// Serializable mirror of [`RetryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            backoff_factor: retry.backoff_factor,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            jitter_fraction: retry.jitter_fraction,
            attempt_timeout_secs: retry.attempt_timeout.as_secs(),
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_fraction: self.jitter_fraction,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Directory for the file-backed backend.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Yaml,
}
