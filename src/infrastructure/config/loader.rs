use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid worker_count: {0}. Must be between 1 and 256")]
    InvalidWorkerCount(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error(
        "Invalid backoff configuration: backoff_base_ms ({0}) must be less than backoff_max_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid request_timeout_ms: {0}. Cannot be 0")]
    InvalidRequestTimeout(u64),

    #[error("Invalid dedup shard_count: {0}. Must be at least 1")]
    InvalidShardCount(usize),

    #[error("Invalid scheduler tick_interval_ms: {0}. Cannot be 0")]
    InvalidTickInterval(u64),

    #[error("Invalid event channel_capacity: {0}. Must be at least 1")]
    InvalidChannelCapacity(usize),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. conductor.yaml (project config)
    /// 3. conductor.local.yaml (local overrides, optional)
    /// 4. Environment variables (CONDUCTOR_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("conductor.yaml"))
            .merge(Yaml::file("conductor.local.yaml"))
            .merge(Env::prefixed("CONDUCTOR_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.worker_count == 0 || config.worker_count > 256 {
            return Err(ConfigError::InvalidWorkerCount(config.worker_count));
        }

        if config.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout(config.request_timeout_ms));
        }

        if config.retry.backoff_base_ms >= config.retry.backoff_max_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.backoff_base_ms,
                config.retry.backoff_max_ms,
            ));
        }

        if config.dedup.shard_count == 0 {
            return Err(ConfigError::InvalidShardCount(config.dedup.shard_count));
        }

        if config.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidTickInterval(
                config.scheduler.tick_interval_ms,
            ));
        }

        if config.events.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity(
                config.events.channel_capacity,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
