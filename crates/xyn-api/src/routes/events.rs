// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event endpoints: list, get, create.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use xyn_core::model::EventRecord;
use xyn_core::store::events::{self, ListEventsFilter, NewEvent};

use crate::error::{ApiError, ApiResult};
use crate::pagination::{clamp_limit, next_cursor, parse_cursor};
use crate::routes::CorrelationId;
use crate::state::ApiState;

/// Query parameters for listing events.
#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    /// Filter by exact event name.
    pub event_name: Option<String>,
    /// Filter by emitting run.
    pub run_id: Option<Uuid>,
    /// Filter by correlation id.
    pub correlation_id: Option<String>,
    /// Page size (1-500, default 50).
    pub limit: Option<i64>,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// Page of events, newest first.
#[derive(Debug, Serialize)]
pub struct EventListResponse {
    /// Page items.
    pub items: Vec<EventRecord>,
    /// Cursor for the next page, when more rows exist.
    pub next_cursor: Option<String>,
}

/// List events newest-first with optional filters.
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let limit = clamp_limit(query.limit);

    // The cursor is an event id; its (occurred_at, id) position bounds the page.
    let after = match parse_cursor(query.cursor.as_deref()) {
        Some(cursor_id) => events::get(&state.pool, cursor_id)
            .await?
            .map(|event| (event.occurred_at, event.id)),
        None => None,
    };

    let filter = ListEventsFilter {
        event_name: query.event_name,
        run_id: query.run_id,
        correlation_id: query.correlation_id,
    };

    let mut items = events::list(&state.pool, &filter, after, limit + 1).await?;
    let next_cursor = next_cursor(&mut items, limit, |event| event.id);

    Ok(Json(EventListResponse { items, next_cursor }))
}

/// Get a single event.
pub async fn get_event(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EventRecord>> {
    let event = events::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Event '{}' not found", id)))?;
    Ok(Json(event))
}

/// Body for submitting an event.
#[derive(Debug, Deserialize)]
pub struct EventCreateRequest {
    /// Dotted lowercase event name.
    pub event_name: String,
    /// Free-form payload.
    #[serde(default)]
    pub data: Value,
    /// Emitting run, when any.
    pub run_id: Option<Uuid>,
    /// Emitting step, when any.
    pub step_id: Option<Uuid>,
    /// Referenced resource.
    pub resource: Option<ResourceRef>,
}

/// A resource reference on a submitted event.
#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource id.
    pub id: String,
}

/// Append one event.
pub async fn create_event(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(request): Json<EventCreateRequest>,
) -> ApiResult<(StatusCode, Json<EventRecord>)> {
    if request.event_name.is_empty() {
        return Err(ApiError::Validation("event_name is required".to_string()));
    }

    let mut event = NewEvent::new(&request.event_name, &correlation.0);
    event.env_id = state.env_id.clone();
    event.actor = "api".to_string();
    event.run_id = request.run_id;
    event.step_id = request.step_id;
    if let Some(resource) = &request.resource {
        event.resource_type = Some(resource.resource_type.clone());
        event.resource_id = Some(resource.id.clone());
    }
    event.data = if request.data.is_null() {
        json!({})
    } else {
        request.data
    };

    let id = events::emit(&state.pool, event).await?;
    let stored = events::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::Internal("stored event vanished".to_string()))?;
    Ok((StatusCode::CREATED, Json(stored)))
}
