//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AdmissionError, Result};

/// Main configuration for a Turnstile deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Admission policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Counter store selection
    #[serde(default)]
    pub store: StoreConfig,
}

/// Admission policy options.
///
/// Options that carry behaviour rather than data (key function, dynamic
/// limit, reject callbacks) are supplied through
/// [`AdmissionBuilder`](crate::admission::AdmissionBuilder) instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Requests allowed per fixed window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Fixed window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Extra requests allowed on top of `limit`, counted in their own window.
    /// Zero disables the overlay.
    #[serde(default)]
    pub burst_limit: u64,

    /// Burst window length in milliseconds (defaults to `window_ms`)
    #[serde(default)]
    pub burst_window_ms: Option<u64>,

    /// Switches counting to token-bucket mode when present
    #[serde(default)]
    pub token_bucket: Option<TokenBucketConfig>,

    /// Keys that bypass all counting
    #[serde(default)]
    pub allow_list: Vec<String>,

    /// Keys that are always rejected
    #[serde(default)]
    pub deny_list: Vec<String>,

    /// Annotate responses with `X-RateLimit-*` headers
    #[serde(default = "default_true")]
    pub emit_headers: bool,

    /// Keep per-key request/block tallies
    #[serde(default)]
    pub metrics: bool,

    /// Report admission events at info level
    #[serde(default)]
    pub log_events: bool,

    /// Append admission events to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            burst_limit: 0,
            burst_window_ms: None,
            token_bucket: None,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            emit_headers: true,
            metrics: false,
            log_events: false,
            log_file: None,
        }
    }
}

/// Token-bucket options. Unset fields fall back to the base limit and window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Bucket capacity, refilled completely every interval
    #[serde(default)]
    pub tokens_per_interval: Option<u64>,

    /// Refill interval in milliseconds
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl PolicyConfig {
    /// Fixed-window policy with the given limit and window.
    pub fn fixed_window(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            ..Self::default()
        }
    }

    /// Token-bucket policy with the given capacity and refill interval.
    pub fn token_bucket(tokens_per_interval: u64, interval_ms: u64) -> Self {
        Self {
            token_bucket: Some(TokenBucketConfig {
                tokens_per_interval: Some(tokens_per_interval),
                interval_ms: Some(interval_ms),
            }),
            ..Self::default()
        }
    }

    /// Add a burst overlay.
    pub fn with_burst(mut self, burst_limit: u64, burst_window_ms: u64) -> Self {
        self.burst_limit = burst_limit;
        self.burst_window_ms = Some(burst_window_ms);
        self
    }

    /// Effective burst window.
    pub fn burst_window_ms(&self) -> u64 {
        self.burst_window_ms.unwrap_or(self.window_ms)
    }

    /// Effective token-bucket capacity and interval, if the mode is on.
    pub fn bucket_params(&self) -> Option<(u64, u64)> {
        self.token_bucket.as_ref().map(|tb| {
            (
                tb.tokens_per_interval.unwrap_or(self.limit),
                tb.interval_ms.unwrap_or(self.window_ms),
            )
        })
    }

    /// Reject settings that could never produce a meaningful decision.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(AdmissionError::Configuration(
                "window_ms must be positive".to_string(),
            ));
        }

        if self.burst_limit > 0 && self.burst_window_ms() == 0 {
            return Err(AdmissionError::Configuration(
                "burst_window_ms must be positive when burst_limit is set".to_string(),
            ));
        }

        if let Some((capacity, interval_ms)) = self.bucket_params() {
            if capacity == 0 {
                return Err(AdmissionError::Configuration(
                    "tokens_per_interval must be positive when using token bucket".to_string(),
                ));
            }
            if interval_ms == 0 {
                return Err(AdmissionError::Configuration(
                    "interval_ms must be positive when using token bucket".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Which counter store backs the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix prepended to every remote key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout for remote calls in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: None,
        }
    }
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, layered with
    /// `TURNSTILE__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AdmissionError::Configuration(e.to_string()))?;

        let config: TurnstileConfig = config
            .try_deserialize()
            .map_err(|e| AdmissionError::Configuration(e.to_string()))?;
        config.policy.validate()?;
        Ok(config)
    }
}
