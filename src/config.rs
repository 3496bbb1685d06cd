//! Configuration management for Turnstile.

use std::path::Path;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Prefix for environment overrides, e.g. `TURNSTILE__LIMITS__MINUTE_LIMIT=20`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Quota and abuse-escalation settings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Quota and abuse-escalation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests admitted per identity per minute window
    #[serde(default = "default_minute_limit")]
    pub minute_limit: u64,

    /// Requests admitted per identity per day window
    #[serde(default = "default_day_limit")]
    pub day_limit: u64,

    /// Violations that escalate an identity into a block
    #[serde(default = "default_abuse_threshold")]
    pub abuse_threshold: u32,

    /// How long a block lasts, in seconds
    #[serde(default = "default_block_duration")]
    pub block_duration_seconds: i64,

    /// Offset from UTC of the timezone that defines the day boundary
    #[serde(default)]
    pub utc_offset_seconds: i32,

    /// Longest identity accepted, in bytes
    #[serde(default = "default_max_identity_len")]
    pub max_identity_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            minute_limit: default_minute_limit(),
            day_limit: default_day_limit(),
            abuse_threshold: default_abuse_threshold(),
            block_duration_seconds: default_block_duration(),
            utc_offset_seconds: 0,
            max_identity_len: default_max_identity_len(),
        }
    }
}

fn default_minute_limit() -> u64 {
    10
}

fn default_day_limit() -> u64 {
    1000
}

fn default_abuse_threshold() -> u32 {
    5
}

fn default_block_duration() -> i64 {
    600
}

fn default_max_identity_len() -> usize {
    256
}

impl LimitsConfig {
    /// Check the settings for values the engine cannot honor.
    ///
    /// Zero quotas are allowed: the first request of each window is still admitted.
    pub fn validate(&self) -> Result<()> {
        if self.abuse_threshold == 0 {
            return Err(TurnstileError::Config(
                "abuse_threshold must be at least 1".to_string(),
            ));
        }
        if self.block_duration_seconds <= 0 {
            return Err(TurnstileError::Config(format!(
                "block_duration_seconds must be positive, got {}",
                self.block_duration_seconds
            )));
        }
        if self.max_identity_len == 0 {
            return Err(TurnstileError::Config(
                "max_identity_len must be at least 1".to_string(),
            ));
        }
        self.utc_offset().map(|_| ())
    }

    /// The reference timezone for day windows.
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            TurnstileError::Config(format!(
                "utc_offset_seconds out of range: {}",
                self.utc_offset_seconds
            ))
        })
    }
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Event format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__`-prefixed environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder =
                builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<TurnstileConfig>())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }
}
