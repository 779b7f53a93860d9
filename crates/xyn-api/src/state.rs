// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared state for API handlers.

use std::time::Instant;

use sqlx::PgPool;

/// Shared state cloned into every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Database pool.
    pub pool: PgPool,
    /// Environment id stamped on enqueued runs and events.
    pub env_id: String,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
    /// Crate version served by /health.
    pub version: &'static str,
}

impl ApiState {
    /// New state over a pool.
    pub fn new(pool: PgPool, env_id: String) -> Self {
        Self {
            pool,
            env_id,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
