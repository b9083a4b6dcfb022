// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for vajra-functions.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL for the durable registry. `None` runs memory-only.
    pub database_url: Option<String>,
    /// Data directory for artifacts and invocation workspaces
    pub data_dir: PathBuf,
    /// Number of deployment workers draining the job queue
    pub deploy_workers: usize,
    /// Simulated build duration
    pub build_delay: Duration,
    /// Base URL used to derive function endpoints
    pub endpoint_base: String,
    /// Interpreter used for python runtimes
    pub python_bin: String,
    /// Interpreter used for nodejs runtimes
    pub node_bin: String,
    /// Log entries retained per function
    pub log_retention: usize,
    /// How long to wait for a durable connection before falling back
    pub db_acquire_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            data_dir: PathBuf::from(".data"),
            deploy_workers: 4,
            build_delay: Duration::ZERO,
            endpoint_base: "https://functions.vajra.local".to_string(),
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),
            log_retention: 100,
            db_acquire_timeout: Duration::from_millis(2000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("VAJRA_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let deploy_workers = parse_var("VAJRA_DEPLOY_WORKERS", defaults.deploy_workers)?;
        if deploy_workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "VAJRA_DEPLOY_WORKERS",
                value: "0".to_string(),
            });
        }

        let build_delay = Duration::from_millis(parse_var("VAJRA_BUILD_DELAY_MS", 0u64)?);
        let db_acquire_timeout =
            Duration::from_millis(parse_var("VAJRA_DB_ACQUIRE_TIMEOUT_MS", 2000u64)?);

        let endpoint_base = std::env::var("VAJRA_ENDPOINT_BASE")
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or(defaults.endpoint_base);

        Ok(Self {
            database_url,
            data_dir,
            deploy_workers,
            build_delay,
            endpoint_base,
            python_bin: std::env::var("VAJRA_PYTHON_BIN").unwrap_or(defaults.python_bin),
            node_bin: std::env::var("VAJRA_NODE_BIN").unwrap_or(defaults.node_bin),
            log_retention: parse_var("VAJRA_LOG_RETENTION", defaults.log_retention)?,
            db_acquire_timeout,
        })
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}
