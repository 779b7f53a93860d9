// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::ApiState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` when the process answers.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Seconds since process start.
    pub uptime_seconds: u64,
    /// Current server time, UTC.
    pub now: DateTime<Utc>,
}

/// Current system status and version information.
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        now: Utc::now(),
    })
}
