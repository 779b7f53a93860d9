// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run endpoints: submit, list, get, cancel, steps.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use xyn_core::model::{RunRecord, RunStatus, StepRecord};
use xyn_core::queue;
use xyn_core::store::runs::{self, NewRun};
use xyn_core::store::steps;

use crate::error::{ApiError, ApiResult};
use crate::pagination::{clamp_limit, next_cursor, parse_cursor};
use crate::routes::CorrelationId;
use crate::state::ApiState;

/// Body for submitting a run.
#[derive(Debug, Deserialize)]
pub struct RunCreateRequest {
    /// Human name; doubles as the blueprint reference when none is set.
    pub name: String,
    /// Optional blueprint reference.
    pub blueprint_ref: Option<String>,
    /// Input payload.
    #[serde(default)]
    pub inputs: Value,
    /// Claim priority; lower claims earlier (default 100).
    pub priority: Option<i32>,
    /// Earliest eligible claim time; defaults to now.
    pub run_at: Option<DateTime<Utc>>,
    /// Retry ceiling; absent means unlimited retries.
    pub max_attempts: Option<i32>,
}

/// Submit a run; it is inserted in status `queued` and picked up by a worker.
pub async fn create_run(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(request): Json<RunCreateRequest>,
) -> ApiResult<(StatusCode, Json<RunRecord>)> {
    if request.name.is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let inputs = if request.inputs.is_null() {
        json!({})
    } else {
        request.inputs
    };

    let mut new = NewRun::new(&request.name, inputs);
    new.blueprint_ref = request.blueprint_ref;
    new.actor = "api".to_string();
    new.correlation_id = Some(correlation.0.clone());
    new.env_id = state.env_id.clone();
    new.priority = request.priority.unwrap_or(100);
    new.run_at = request.run_at;
    new.max_attempts = request.max_attempts;

    let run = runs::enqueue(&state.pool, new).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// Query parameters for listing runs.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// Filter by status.
    pub status: Option<String>,
    /// Page size (1-500, default 50).
    pub limit: Option<i64>,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// Page of runs, newest first.
#[derive(Debug, Serialize)]
pub struct RunListResponse {
    /// Page items.
    pub items: Vec<RunRecord>,
    /// Cursor for the next page, when more rows exist.
    pub next_cursor: Option<String>,
}

/// List runs newest-first with an optional status filter.
pub async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<RunListResponse>> {
    let limit = clamp_limit(query.limit);
    let cursor = parse_cursor(query.cursor.as_deref());

    // An unknown status can match nothing; reject it early.
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<RunStatus>()
                .map_err(ApiError::Validation)?
                .as_str(),
        ),
        None => None,
    };

    let mut items = runs::list(&state.pool, status, cursor, limit + 1).await?;
    let next_cursor = next_cursor(&mut items, limit, |run| run.id);

    Ok(Json(RunListResponse { items, next_cursor }))
}

/// Get a single run.
pub async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunRecord>> {
    let run = runs::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run '{}' not found", id)))?;
    Ok(Json(run))
}

/// Cancel a run. Queued runs cancel immediately; running runs get the
/// cooperative flag. Idempotent on terminal runs.
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunRecord>> {
    let run = queue::cancel(&state.pool, id, &state.env_id).await?;
    Ok(Json(run))
}

/// Steps of a run in ascending idx order.
pub async fn list_steps(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<StepRecord>>> {
    runs::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run '{}' not found", id)))?;
    let step_rows = steps::list_for_run(&state.pool, id).await?;
    Ok(Json(step_rows))
}
