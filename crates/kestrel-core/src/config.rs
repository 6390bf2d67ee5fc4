// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Engine configuration.
///
/// Engine limits (step and depth caps, timer thresholds) are compile-time
/// constants in the crate root; only deployment concerns live here.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; absent for in-memory deployments.
    pub database_url: Option<String>,
    /// How long to wait for an instance's advisory lock.
    pub lock_wait: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `KESTREL_DATABASE_URL`: PostgreSQL connection string
    /// - `KESTREL_LOCK_WAIT_SECS`: advisory-lock wait in seconds (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KESTREL_DATABASE_URL").ok();

        let lock_wait_secs: u64 = std::env::var("KESTREL_LOCK_WAIT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KESTREL_LOCK_WAIT_SECS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            lock_wait: Duration::from_secs(lock_wait_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
