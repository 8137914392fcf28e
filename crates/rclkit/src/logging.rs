// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Log output setup.
//!
//! The runtime only emits `tracing` events; installing a subscriber is left
//! to the application. [`init`] installs the usual `fmt` subscriber with an
//! `EnvFilter`, taking its directives from `RCLKIT_LOG` when set.

use crate::config::RuntimeConfig;
use tracing_subscriber::EnvFilter;

/// Environment variable holding `EnvFilter` directives.
pub const ENV_LOG: &str = "RCLKIT_LOG";

/// Installs a global `fmt` subscriber.
///
/// `default_filter` is used when `RCLKIT_LOG` is unset or invalid, and falls
/// back to `info` if it does not parse either. Returns `false` when a global
/// subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_filter))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// [`init`] with the configured log level as default.
pub fn init_from_config(config: &RuntimeConfig) -> bool {
    init(&config.log_level)
}

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
