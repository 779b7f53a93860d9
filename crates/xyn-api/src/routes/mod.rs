// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router assembly and the correlation-id middleware.
//!
//! Domain routes live under `/api/v1`; `/health` and `/metrics` are also
//! reachable unversioned for probes and scrapers.

pub mod events;
pub mod health;
pub mod packs;
pub mod runs;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use crate::metrics;
use crate::state::ApiState;

/// Correlation id extracted from (or minted for) the current request.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

const CORRELATION_HEADER: &str = "x-correlation-id";

/// Propagate the caller's correlation id, or mint one, and echo it on the
/// response.
pub async fn correlation_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// Build the full application router.
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/health", get(health::health_check))
        .route("/events", get(events::list_events).post(events::create_event))
        .route("/events/:id", get(events::get_event))
        .route("/runs", post(runs::create_run).get(runs::list_runs))
        .route("/runs/:id", get(runs::get_run))
        .route("/runs/:id/cancel", post(runs::cancel_run))
        .route("/runs/:id/steps", get(runs::list_steps))
        .route("/packs", get(packs::list_packs))
        .route("/packs/:pack_ref/status", get(packs::pack_status))
        .route("/packs/:pack_ref/install", post(packs::install_pack));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::serve_metrics))
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state)
}
