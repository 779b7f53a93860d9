// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run rows: enqueue, lookup, listing and lineage edges.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{RunEdgeRecord, RunRecord};
use crate::store::events::{self, names, NewEvent};

pub(crate) const RUN_COLUMNS: &str = "id, name, blueprint_ref, status, actor, correlation_id, \
     inputs, outputs, error, priority, attempt, max_attempts, run_at, queued_at, created_at, \
     started_at, completed_at, locked_at, locked_by, lease_expires_at, cancel_requested, \
     parent_run_id";

/// A new run to enqueue.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Human name; doubles as the blueprint reference when none is set.
    pub name: String,
    /// Optional blueprint reference.
    pub blueprint_ref: Option<String>,
    /// Actor enqueuing the run.
    pub actor: String,
    /// Correlation id; generated when absent.
    pub correlation_id: Option<String>,
    /// Environment id for the creation event.
    pub env_id: String,
    /// Input payload.
    pub inputs: Value,
    /// Claim priority; lower claims earlier.
    pub priority: i32,
    /// Earliest eligible claim time; defaults to now.
    pub run_at: Option<DateTime<Utc>>,
    /// Retry ceiling; NULL means unlimited retries.
    pub max_attempts: Option<i32>,
    /// Parent run for spawned children.
    pub parent_run_id: Option<Uuid>,
}

impl NewRun {
    /// New run with default scheduling (now, priority 100).
    pub fn new(name: &str, inputs: Value) -> Self {
        Self {
            name: name.to_string(),
            blueprint_ref: None,
            actor: "system".to_string(),
            correlation_id: None,
            env_id: "local-dev".to_string(),
            inputs,
            priority: 100,
            run_at: None,
            max_attempts: None,
            parent_run_id: None,
        }
    }
}

/// Insert a run row in status `queued`. Does not emit; see [`enqueue`].
pub async fn insert_queued(conn: &mut PgConnection, new: &NewRun) -> Result<RunRecord> {
    let id = Uuid::new_v4();
    let correlation_id = new
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let sql = format!(
        r#"
        INSERT INTO runs
            (id, name, blueprint_ref, status, actor, correlation_id, inputs,
             priority, run_at, max_attempts, parent_run_id, queued_at, created_at)
        VALUES ($1, $2, $3, 'queued', $4, $5, $6, $7, COALESCE($8, NOW()), $9, $10, NOW(), NOW())
        RETURNING {}
        "#,
        RUN_COLUMNS
    );

    let record = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .bind(&new.name)
        .bind(&new.blueprint_ref)
        .bind(&new.actor)
        .bind(&correlation_id)
        .bind(&new.inputs)
        .bind(new.priority)
        .bind(new.run_at)
        .bind(new.max_attempts)
        .bind(new.parent_run_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(record)
}

/// Enqueue a run: insert the row and emit `xyn.run.created` in one transaction.
pub async fn enqueue(pool: &PgPool, new: NewRun) -> Result<RunRecord> {
    let mut tx = pool.begin().await?;
    let record = insert_queued(&mut tx, &new).await?;

    let mut event = NewEvent::new(names::RUN_CREATED, &record.correlation_id);
    event.env_id = new.env_id.clone();
    event.actor = record.actor.clone();
    event.run_id = Some(record.id);
    event.resource_type = Some("run".to_string());
    event.resource_id = Some(record.id.to_string());
    event.data = json!({
        "name": record.name,
        "blueprint_ref": record.blueprint_ref,
        "priority": record.priority,
        "run_at": record.run_at,
    });
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;

    tracing::info!(
        run_id = %record.id,
        name = %record.name,
        priority = record.priority,
        correlation_id = %record.correlation_id,
        "Enqueued run"
    );

    Ok(record)
}

/// Get a run by id.
pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<RunRecord>> {
    let sql = format!("SELECT {} FROM runs WHERE id = $1", RUN_COLUMNS);
    let record = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// List runs newest-first with optional status filter and id cursor.
///
/// The cursor is the id of the last row of the previous page; its
/// `(created_at, id)` position bounds the next page.
pub async fn list(
    pool: &PgPool,
    status: Option<&str>,
    cursor: Option<Uuid>,
    limit: i64,
) -> Result<Vec<RunRecord>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM runs
        WHERE ($1::TEXT IS NULL OR status = $1)
          AND ($2::UUID IS NULL
               OR NOT EXISTS (SELECT 1 FROM runs c WHERE c.id = $2)
               OR (created_at, id) < (SELECT c.created_at, c.id FROM runs c WHERE c.id = $2))
        ORDER BY created_at DESC, id DESC
        LIMIT $3
        "#,
        RUN_COLUMNS
    );

    let records = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(status)
        .bind(cursor)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(records)
}

/// Read the cooperative cancellation flag.
pub async fn cancel_requested(pool: &PgPool, id: Uuid) -> Result<bool> {
    let row: Option<(bool,)> = sqlx::query_as("SELECT cancel_requested FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0).unwrap_or(false))
}

/// Insert a lineage edge between a parent and a spawned child.
pub async fn insert_edge(
    conn: &mut PgConnection,
    parent_run_id: Uuid,
    child_run_id: Uuid,
    relation: &str,
    child_key: Option<&str>,
) -> Result<RunEdgeRecord> {
    let record = sqlx::query_as::<_, RunEdgeRecord>(
        r#"
        INSERT INTO run_edges (id, parent_run_id, child_run_id, relation, child_key)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, parent_run_id, child_run_id, relation, child_key, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(parent_run_id)
    .bind(child_run_id)
    .bind(relation)
    .bind(child_key)
    .fetch_one(&mut *conn)
    .await?;

    Ok(record)
}

/// Find the edge spawned under an idempotency key, when it exists.
pub async fn find_edge(
    pool: &PgPool,
    parent_run_id: Uuid,
    child_key: &str,
) -> Result<Option<RunEdgeRecord>> {
    let record = sqlx::query_as::<_, RunEdgeRecord>(
        r#"
        SELECT id, parent_run_id, child_run_id, relation, child_key, created_at
        FROM run_edges
        WHERE parent_run_id = $1 AND child_key = $2
        "#,
    )
    .bind(parent_run_id)
    .bind(child_key)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}
