// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API process configuration.

use std::net::SocketAddr;

/// API-specific configuration; core settings come from [`xyn_core::config`].
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// Worker slots colocated in this process (0 disables them).
    pub embedded_workers: usize,
}

impl ApiConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `XYN_API_PORT`: HTTP port (default: 8000)
    /// - `XYN_EMBEDDED_WORKERS`: colocated worker slots (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("XYN_API_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("XYN_API_PORT", "must be a valid port number"))?;

        let embedded_workers: usize = std::env::var("XYN_EMBEDDED_WORKERS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("XYN_EMBEDDED_WORKERS", "must be a non-negative integer")
            })?;

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            embedded_workers,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
