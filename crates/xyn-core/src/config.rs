// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Core runtime configuration shared by workers and the API process.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Environment id stamped on events and installations.
    pub env_id: String,
    /// Opaque worker identity stamped on `locked_by`.
    pub worker_id: String,
    /// Lease duration for claimed runs.
    pub lease_duration: Duration,
    /// Worker sleep when the queue is empty.
    pub idle_poll: Duration,
    /// Metrics collector tick interval.
    pub metrics_interval: Duration,
    /// Whether to run embedded migrations at startup.
    pub auto_create_schema: bool,
    /// Migration ids that must be present when auto-create is off.
    pub required_migrations: Vec<i64>,
    /// Base directory for the content-addressed artifact store.
    pub artifacts_dir: PathBuf,
    /// Retry backoff parameters for failed runs.
    pub backoff: BackoffConfig,
    /// Per-run wall-clock limit.
    pub run_deadline: Duration,
    /// Per-run step budget.
    pub max_steps: u32,
}

impl CoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `ENV_ID`: environment id (default: `local-dev`)
    /// - `WORKER_ID`: worker identity (default: `<host>-<pid>`)
    /// - `LEASE_DURATION_SECONDS`: run lease duration (default: 60)
    /// - `IDLE_POLL_MS`: idle poll sleep (default: 500)
    /// - `METRICS_COLLECTOR_INTERVAL`: collector tick seconds (default: 5)
    /// - `XYN_AUTO_CREATE_SCHEMA`: run migrations at boot (default: true)
    /// - `XYN_REQUIRED_MIGRATIONS`: comma-separated migration ids required at
    ///   boot when auto-create is off
    /// - `XYN_ARTIFACTS_DIR`: artifact store base (default: `./artifacts`)
    /// - `RETRY_BACKOFF_BASE_MS` / `RETRY_BACKOFF_CAP_MS`: retry backoff
    ///   window (defaults: 1000 / 60000)
    /// - `RUN_DEADLINE_SECONDS`: per-run wall-clock limit (default: 3600)
    /// - `MAX_STEPS_PER_RUN`: per-run step budget (default: 200)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let env_id = std::env::var("ENV_ID").unwrap_or_else(|_| "local-dev".to_string());

        let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());

        let lease_seconds: u64 = parse_var("LEASE_DURATION_SECONDS", "60")?;
        let idle_poll_ms: u64 = parse_var("IDLE_POLL_MS", "500")?;
        let metrics_seconds: u64 = parse_var("METRICS_COLLECTOR_INTERVAL", "5")?;

        let auto_create_schema = match std::env::var("XYN_AUTO_CREATE_SCHEMA") {
            Ok(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "XYN_AUTO_CREATE_SCHEMA",
                        "must be true or false",
                    ))
                }
            },
            Err(_) => true,
        };

        let required_migrations = match std::env::var("XYN_REQUIRED_MIGRATIONS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<i64>().map_err(|_| {
                        ConfigError::Invalid(
                            "XYN_REQUIRED_MIGRATIONS",
                            "must be a comma-separated list of migration ids",
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => Vec::new(),
        };

        let artifacts_dir = std::env::var("XYN_ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./artifacts"));

        let backoff_base_ms: u64 = parse_var("RETRY_BACKOFF_BASE_MS", "1000")?;
        let backoff_cap_ms: u64 = parse_var("RETRY_BACKOFF_CAP_MS", "60000")?;
        let run_deadline_seconds: u64 = parse_var("RUN_DEADLINE_SECONDS", "3600")?;
        let max_steps: u32 = parse_var("MAX_STEPS_PER_RUN", "200")?;

        Ok(Self {
            database_url,
            env_id,
            worker_id,
            lease_duration: Duration::from_secs(lease_seconds),
            idle_poll: Duration::from_millis(idle_poll_ms),
            metrics_interval: Duration::from_secs(metrics_seconds),
            auto_create_schema,
            required_migrations,
            artifacts_dir,
            backoff: BackoffConfig {
                base: Duration::from_millis(backoff_base_ms),
                cap: Duration::from_millis(backoff_cap_ms),
                multiplier: 2.0,
            },
            run_deadline: Duration::from_secs(run_deadline_seconds),
            max_steps,
        })
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, "must be a positive integer"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
