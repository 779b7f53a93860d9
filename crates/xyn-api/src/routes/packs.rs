// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pack endpoints: catalog listing, installation status, install.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use xyn_core::blueprints::pack_install::PACK_INSTALL_REF;
use xyn_core::model::{InstallStatus, PackInstallationRecord, PackRecord};
use xyn_core::store::events::{self, names, NewEvent};
use xyn_core::store::packs;
use xyn_core::store::runs::{self, NewRun};

use crate::error::{ApiError, ApiResult};
use crate::pagination::{clamp_limit, next_cursor, parse_cursor};
use crate::routes::CorrelationId;
use crate::state::ApiState;

/// Query parameters for listing packs.
#[derive(Debug, Default, Deserialize)]
pub struct ListPacksQuery {
    /// Page size (1-500, default 50).
    pub limit: Option<i64>,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// A pack with its installation state in the current environment.
#[derive(Debug, Serialize)]
pub struct PackWithInstallation {
    /// Catalog entry.
    pub pack: PackRecord,
    /// Installation row, when one exists.
    pub installation: Option<PackInstallationRecord>,
}

/// Page of packs.
#[derive(Debug, Serialize)]
pub struct PackListResponse {
    /// Page items.
    pub items: Vec<PackWithInstallation>,
    /// Cursor for the next page, when more rows exist.
    pub next_cursor: Option<String>,
}

/// List packs with their installation status.
pub async fn list_packs(
    State(state): State<ApiState>,
    Query(query): Query<ListPacksQuery>,
) -> ApiResult<Json<PackListResponse>> {
    let limit = clamp_limit(query.limit);
    let cursor = parse_cursor(query.cursor.as_deref());

    let mut pack_rows = packs::list_packs(&state.pool, cursor, limit + 1).await?;
    let next_cursor = next_cursor(&mut pack_rows, limit, |pack| pack.id);

    let mut items = Vec::with_capacity(pack_rows.len());
    for pack in pack_rows {
        let installation =
            packs::get_installation(&state.pool, &pack.pack_ref, &state.env_id).await?;
        items.push(PackWithInstallation { pack, installation });
    }

    Ok(Json(PackListResponse { items, next_cursor }))
}

/// Installation status for one pack.
#[derive(Debug, Serialize)]
pub struct PackStatusResponse {
    /// Pack reference.
    pub pack_ref: String,
    /// Installation status; `available` when nothing is installed.
    pub status: String,
    /// Installation row, when one exists.
    pub installation: Option<PackInstallationRecord>,
}

/// Get pack installation status for the current environment.
pub async fn pack_status(
    State(state): State<ApiState>,
    Path(pack_ref): Path<String>,
) -> ApiResult<Json<PackStatusResponse>> {
    let pack = packs::get_pack(&state.pool, &pack_ref)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pack '{}' not found", pack_ref)))?;

    let installation = packs::get_installation(&state.pool, &pack.pack_ref, &state.env_id).await?;
    let status = installation
        .as_ref()
        .map(|row| row.status.clone())
        .unwrap_or_else(|| InstallStatus::Available.as_str().to_string());

    Ok(Json(PackStatusResponse {
        pack_ref: pack.pack_ref,
        status,
        installation,
    }))
}

/// Optional body for the install endpoint: scheduling and retry knobs.
#[derive(Debug, Default, Deserialize)]
pub struct PackInstallRequest {
    /// Claim priority for the installation run.
    pub priority: Option<i32>,
    /// Schedule the installation for later.
    pub run_at: Option<DateTime<Utc>>,
    /// Retry ceiling for the installation run.
    pub max_attempts: Option<i32>,
}

/// Accepted installation: poll the run for progress.
#[derive(Debug, Serialize)]
pub struct PackInstallResponse {
    /// The enqueued installation run.
    pub run_id: uuid::Uuid,
    /// Run status at enqueue time (`queued`).
    pub status: String,
    /// Pack reference.
    pub pack_ref: String,
    /// Claim priority.
    pub priority: i32,
    /// Earliest claim time.
    pub run_at: DateTime<Utc>,
    /// Correlation id for the run's event stream.
    pub correlation_id: String,
    /// Human hint.
    pub message: String,
}

/// Enqueue a pack installation for async execution by a worker.
///
/// Returns 202 with the run id; a pre-existing installation in a conflicting
/// state returns 409 with the typed detail body. The installer re-checks
/// atomically at claim time, so the pre-flight here is advisory only.
pub async fn install_pack(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(pack_ref): Path<String>,
    payload: Option<Json<PackInstallRequest>>,
) -> ApiResult<(StatusCode, Json<PackInstallResponse>)> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();

    let pack = packs::get_pack(&state.pool, &pack_ref)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pack '{}' not found", pack_ref)))?;

    if let Some(existing) =
        packs::get_installation(&state.pool, &pack.pack_ref, &state.env_id).await?
    {
        if existing.install_status() != Some(InstallStatus::Available) {
            return Err(ApiError::Conflict(packs::conflict_error(&existing)));
        }
    }

    let mut new = NewRun::new(
        PACK_INSTALL_REF,
        json!({ "pack_ref": pack.pack_ref, "env_id": state.env_id }),
    );
    new.actor = "api".to_string();
    new.correlation_id = Some(correlation.0.clone());
    new.env_id = state.env_id.clone();
    new.priority = request.priority.unwrap_or(100);
    new.run_at = request.run_at;
    new.max_attempts = request.max_attempts;

    let run = runs::enqueue(&state.pool, new).await?;

    let mut event = NewEvent::new(names::PACK_INSTALL_REQUESTED, &run.correlation_id);
    event.env_id = state.env_id.clone();
    event.actor = "api".to_string();
    event.run_id = Some(run.id);
    event.resource_type = Some("pack".to_string());
    event.resource_id = Some(pack.pack_ref.clone());
    event.data = json!({ "pack_ref": pack.pack_ref, "env_id": state.env_id });
    events::emit(&state.pool, event).await?;

    let message = if run.run_at > Utc::now() {
        format!(
            "Pack installation scheduled for {}. Poll GET /api/v1/runs/{{run_id}} for progress.",
            run.run_at
        )
    } else {
        "Pack installation queued. Poll GET /api/v1/runs/{run_id} for progress.".to_string()
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(PackInstallResponse {
            run_id: run.id,
            status: run.status,
            pack_ref: pack.pack_ref,
            priority: run.priority,
            run_at: run.run_at,
            correlation_id: run.correlation_id,
            message,
        }),
    ))
}
