// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only event emission and indexed lookup.
//!
//! Events are the durable audit record. They are never updated or deleted;
//! external publication, when it exists, tails this table downstream
//! (transactional outbox). Emission never blocks on consumers.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::model::EventRecord;

/// Canonical event names emitted by the runtime.
pub mod names {
    /// A run row was inserted in the queue.
    pub const RUN_CREATED: &str = "xyn.run.created";
    /// A worker claimed the run; re-emitted with `data.reclaimed = true` on reclaims.
    pub const RUN_STARTED: &str = "xyn.run.started";
    /// The run finished successfully.
    pub const RUN_COMPLETED: &str = "xyn.run.completed";
    /// The run failed terminally.
    pub const RUN_FAILED: &str = "xyn.run.failed";
    /// The run was cancelled.
    pub const RUN_CANCELLED: &str = "xyn.run.cancelled";
    /// An expired lease was reclaimed back to the queue.
    pub const RUN_RECLAIMED: &str = "xyn.run.reclaimed";
    /// A failed run was rescheduled with backoff.
    pub const RUN_RETRY_SCHEDULED: &str = "xyn.run.retry_scheduled";

    /// A step transitioned to running.
    pub const STEP_STARTED: &str = "xyn.step.started";
    /// A step completed.
    pub const STEP_COMPLETED: &str = "xyn.step.completed";
    /// A step failed.
    pub const STEP_FAILED: &str = "xyn.step.failed";
    /// A step was skipped.
    pub const STEP_SKIPPED: &str = "xyn.step.skipped";
    /// Free-form progress from inside a running step.
    pub const STEP_PROGRESS: &str = "xyn.step.progress";

    /// An artifact was attached to a run or step.
    pub const ARTIFACT_ATTACHED: &str = "xyn.artifact.attached";

    /// A pack installation was requested.
    pub const PACK_INSTALL_REQUESTED: &str = "xyn.pack.install.requested";
    /// A pack installation was finalized.
    pub const PACK_INSTALL_COMPLETED: &str = "xyn.pack.install.completed";
    /// A pack installation failed.
    pub const PACK_INSTALL_FAILED: &str = "xyn.pack.install.failed";
}

/// A new event to emit.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Dotted lowercase event name.
    pub event_name: String,
    /// Correlation id; mandatory, matches the emitting run's.
    pub correlation_id: String,
    /// Environment id.
    pub env_id: String,
    /// Emitting actor.
    pub actor: String,
    /// Emitting run.
    pub run_id: Option<Uuid>,
    /// Emitting step.
    pub step_id: Option<Uuid>,
    /// Referenced resource type.
    pub resource_type: Option<String>,
    /// Referenced resource id.
    pub resource_id: Option<String>,
    /// Free-form payload.
    pub data: Value,
}

impl NewEvent {
    /// New event with defaults for the optional fields.
    pub fn new(event_name: &str, correlation_id: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            correlation_id: correlation_id.to_string(),
            env_id: "local-dev".to_string(),
            actor: "system".to_string(),
            run_id: None,
            step_id: None,
            resource_type: None,
            resource_id: None,
            data: json!({}),
        }
    }
}

const EVENT_COLUMNS: &str = "id, event_name, occurred_at, env_id, actor, correlation_id, \
     run_id, step_id, resource_type, resource_id, data, created_at";

/// Persist one event row and return its id.
///
/// Accepts any executor so the emission can share a transaction with the
/// state change it records.
pub async fn emit<'e, E>(executor: E, event: NewEvent) -> Result<Uuid>
where
    E: PgExecutor<'e>,
{
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO events
            (id, event_name, occurred_at, env_id, actor, correlation_id,
             run_id, step_id, resource_type, resource_id, data)
        VALUES ($1, $2, NOW(), $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(id)
    .bind(&event.event_name)
    .bind(&event.env_id)
    .bind(&event.actor)
    .bind(&event.correlation_id)
    .bind(event.run_id)
    .bind(event.step_id)
    .bind(&event.resource_type)
    .bind(&event.resource_id)
    .bind(&event.data)
    .execute(executor)
    .await?;

    Ok(id)
}

/// Get an event by id.
pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<EventRecord>> {
    let sql = format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS);
    let record = sqlx::query_as::<_, EventRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Filter options for listing events.
#[derive(Debug, Clone, Default)]
pub struct ListEventsFilter {
    /// Filter by exact event name.
    pub event_name: Option<String>,
    /// Filter by emitting run.
    pub run_id: Option<Uuid>,
    /// Filter by correlation id.
    pub correlation_id: Option<String>,
}

/// List events newest-first with keyset pagination.
///
/// `after` is the `(occurred_at, id)` position of the last row of the
/// previous page; rows strictly older are returned.
pub async fn list(
    pool: &PgPool,
    filter: &ListEventsFilter,
    after: Option<(DateTime<Utc>, Uuid)>,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM events
        WHERE ($1::TEXT IS NULL OR event_name = $1)
          AND ($2::UUID IS NULL OR run_id = $2)
          AND ($3::TEXT IS NULL OR correlation_id = $3)
          AND ($4::TIMESTAMPTZ IS NULL OR (occurred_at, id) < ($4, $5))
        ORDER BY occurred_at DESC, id DESC
        LIMIT $6
        "#,
        EVENT_COLUMNS
    );

    let (cursor_at, cursor_id) = match after {
        Some((at, id)) => (Some(at), Some(id)),
        None => (None, None),
    };

    let records = sqlx::query_as::<_, EventRecord>(&sql)
        .bind(&filter.event_name)
        .bind(filter.run_id)
        .bind(&filter.correlation_id)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(records)
}

/// All events for a correlation id in occurrence order, ties broken by id.
pub async fn list_by_correlation(pool: &PgPool, correlation_id: &str) -> Result<Vec<EventRecord>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM events
        WHERE correlation_id = $1
        ORDER BY occurred_at ASC, id ASC
        "#,
        EVENT_COLUMNS
    );
    let records = sqlx::query_as::<_, EventRecord>(&sql)
        .bind(correlation_id)
        .fetch_all(pool)
        .await?;
    Ok(records)
}
