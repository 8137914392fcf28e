// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! Loaded from a TOML file, from environment variables, or built in code:
//!
//! - `RCLKIT_CONFIG_FILE`: TOML file to start from
//! - `RCLKIT_DOMAIN_ID`: domain id (falls back to `ROS_DOMAIN_ID`, then 0)
//! - `RCLKIT_LOG_LEVEL`: default log filter (default: "info")
//!
//! ```toml
//! domain_id = 7
//! log_level = "rclkit=debug"
//! action_result_timeout_secs = 60
//!
//! [qos]
//! depth = 20
//! reliability = "best_effort"
//! ```

use crate::qos::QosProfile;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_FILE: &str = "RCLKIT_CONFIG_FILE";
pub const ENV_DOMAIN_ID: &str = "RCLKIT_DOMAIN_ID";
pub const ENV_LOG_LEVEL: &str = "RCLKIT_LOG_LEVEL";
/// Fallback for `RCLKIT_DOMAIN_ID`.
pub const ENV_ROS_DOMAIN_ID: &str = "ROS_DOMAIN_ID";

/// Highest valid domain id.
pub const MAX_DOMAIN_ID: u32 = 232;

/// Default retention of finished goal results: 15 minutes.
pub const DEFAULT_RESULT_TIMEOUT_SECS: i64 = 15 * 60;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Domain id of the context (0-232), exposed as
    /// [`Context::domain_id`](crate::Context::domain_id). Transports are
    /// built by the caller, so binding one to this domain is up to them.
    #[serde(default)]
    pub domain_id: u32,

    /// Default `EnvFilter` directive for [`logging::init`](crate::logging::init).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Retention of finished goal results in seconds. Negative keeps them
    /// forever.
    #[serde(default = "default_result_timeout")]
    pub action_result_timeout_secs: i64,

    /// Default QoS profile for node endpoints.
    #[serde(default)]
    pub qos: QosProfile,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_result_timeout() -> i64 {
    DEFAULT_RESULT_TIMEOUT_SECS
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            log_level: default_log_level(),
            action_result_timeout_secs: DEFAULT_RESULT_TIMEOUT_SECS,
            qos: QosProfile::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment.
    ///
    /// Priority for the domain id:
    /// 1. `RCLKIT_DOMAIN_ID`
    /// 2. `ROS_DOMAIN_ID`
    /// 3. the config file, or 0
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let mut config = match var(ENV_CONFIG_FILE) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(raw) = var(ENV_DOMAIN_ID).or_else(|| var(ENV_ROS_DOMAIN_ID)) {
            config.domain_id = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("domain id '{}' is not a number", raw.trim()))
            })?;
        }
        if let Some(level) = var(ENV_LOG_LEVEL) {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain_id > MAX_DOMAIN_ID {
            return Err(ConfigError::Invalid(format!(
                "domain id {} exceeds {}",
                self.domain_id, MAX_DOMAIN_ID
            )));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log level is empty".into()));
        }
        Ok(())
    }

    /// Result retention for action servers, `None` to keep results forever.
    pub fn result_timeout(&self) -> Option<Duration> {
        u64::try_from(self.action_result_timeout_secs)
            .ok()
            .map(Duration::from_secs)
    }
}
