//! Configuration management for Harvest
//!
//! Centralized configuration supporting:
//! - YAML/TOML configuration files
//! - Environment variable overrides
//! - Reasonable defaults
//! - Configuration validation

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Root configuration structure for Harvest
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HarvestConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl HarvestConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. Config file specified by HARVEST_CONFIG env var
    /// 3. ./config/harvest.{yaml,toml}
    /// 4. /etc/harvest/harvest.{yaml,toml}
    /// 5. Hardcoded defaults (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        if let Ok(config_path) = std::env::var("HARVEST_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/harvest").required(false))
            .add_source(File::with_name("/etc/harvest/harvest").required(false));

        // Example: HARVEST_RATE_LIMIT__PERMITS_PER_WINDOW=50
        builder = builder.add_source(
            Environment::with_prefix("HARVEST")
                .separator("__")
                .try_parsing(true),
        );

        let config: HarvestConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Set default values for all configuration options
    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            // Scheduler
            .set_default("scheduler.tick_interval_secs", 60)?
            .set_default("scheduler.max_in_flight", 64)?
            .set_default("scheduler.data_lag_days", 14)?
            .set_default("scheduler.orphan_claim_timeout_secs", 1800)?
            // Rate limit
            .set_default("rate_limit.permits_per_window", 100)?
            .set_default("rate_limit.window_secs", 60)?
            // Retry
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.backoff_secs", vec![60_i64, 300])?
            // Execution API
            .set_default("execution.base_url", "http://localhost:8080")?
            .set_default("execution.poll_interval_secs", 30)?
            .set_default("execution.max_poll_duration_secs", 7200)?
            .set_default("execution.request_timeout_secs", 30)?
            // Collections
            .set_default("collection.default_segment_width_days", 7)?
            .set_default("collection.max_backfill_days", 430)?
            // Database
            .set_default("database.url", "sqlite://harvest.db")?
            .set_default("database.max_connections", 8)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Message(
                "scheduler.tick_interval_secs must be > 0".to_string(),
            ));
        }

        if self.scheduler.max_in_flight == 0 {
            return Err(ConfigError::Message(
                "scheduler.max_in_flight must be > 0".to_string(),
            ));
        }

        if self.scheduler.per_collection_concurrency == Some(0) {
            return Err(ConfigError::Message(
                "scheduler.per_collection_concurrency must be > 0 when set".to_string(),
            ));
        }

        if self.rate_limit.permits_per_window == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Message(
                "rate_limit.permits_per_window and rate_limit.window_secs must be > 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }

        if self.execution.poll_interval_secs == 0 {
            return Err(ConfigError::Message(
                "execution.poll_interval_secs must be > 0".to_string(),
            ));
        }

        if self.execution.max_poll_duration_secs < self.execution.poll_interval_secs {
            return Err(ConfigError::Message(
                "execution.max_poll_duration_secs must be >= poll_interval_secs".to_string(),
            ));
        }

        if self.collection.default_segment_width_days == 0 {
            return Err(ConfigError::Message(
                "collection.default_segment_width_days must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: HarvestConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Per-collection dispatch cap, derived from the rate limit when unset.
    pub fn per_collection_concurrency(&self) -> usize {
        self.scheduler
            .per_collection_concurrency
            .unwrap_or_else(|| (self.rate_limit.permits_per_window / 10).clamp(1, 10))
    }
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks
    pub tick_interval_secs: u64,

    /// Concurrent dispatches per collection; derived from the rate limit when unset
    #[serde(default)]
    pub per_collection_concurrency: Option<usize>,

    /// Concurrent dispatches across all collections
    pub max_in_flight: usize,

    /// Days the external system needs before a window's data is complete
    pub data_lag_days: u32,

    /// Seconds after which a claim with no submission is considered abandoned
    pub orphan_claim_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            per_collection_concurrency: None,
            max_in_flight: 64,
            data_lag_days: 14,
            orphan_claim_timeout_secs: 1800,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn orphan_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_claim_timeout_secs)
    }
}

/// Outbound execution API budget
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Permits granted per rolling window
    pub permits_per_window: usize,

    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits_per_window: 100,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Segment retry schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts per segment, first dispatch included
    pub max_attempts: u32,

    /// Delay before each retry in seconds; the last entry repeats
    pub backoff_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![60, 300],
        }
    }
}

impl RetryConfig {
    /// Builds the retry policy described by this configuration
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.backoff_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        )
    }
}

/// External execution API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Base URL of the workflow execution API
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,

    /// Seconds between status polls
    pub poll_interval_secs: u64,

    /// Seconds to wait for a terminal status before treating it as a failure
    pub max_poll_duration_secs: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            poll_interval_secs: 30,
            max_poll_duration_secs: 7200,
            request_timeout_secs: 30,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_secs(self.max_poll_duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Limits applied when creating collections
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionConfig {
    /// Segment width used when a request does not name one
    pub default_segment_width_days: u32,

    /// Longest accepted backfill range in days
    pub max_backfill_days: u32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            default_segment_width_days: 7,
            max_backfill_days: 430,
        }
    }
}

/// Metadata database settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,

    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://harvest.db".to_string(),
            max_connections: 8,
        }
    }
}
