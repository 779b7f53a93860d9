// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step rows. `idx` is 0-based and unique per run; rows are mutated only by
//! the executing worker and never deleted for an observed run.

use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{StepKind, StepRecord};

const STEP_COLUMNS: &str = "id, run_id, name, idx, kind, status, inputs, outputs, error, \
     logs_artifact_id, created_at, started_at, completed_at";

/// Insert the next step for a run in status `created`.
///
/// The idx is assigned from the current row count inside the caller's
/// transaction; the unique index on `(run_id, idx)` backstops races.
pub async fn insert_next(
    conn: &mut PgConnection,
    run_id: Uuid,
    name: &str,
    kind: StepKind,
    inputs: Option<&Value>,
) -> Result<StepRecord> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM steps WHERE run_id = $1")
        .bind(run_id)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        r#"
        INSERT INTO steps (id, run_id, name, idx, kind, status, inputs)
        VALUES ($1, $2, $3, $4, $5, 'created', $6)
        RETURNING {}
        "#,
        STEP_COLUMNS
    );

    let record = sqlx::query_as::<_, StepRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(name)
        .bind(count as i32)
        .bind(kind.as_str())
        .bind(inputs)
        .fetch_one(&mut *conn)
        .await?;

    Ok(record)
}

/// Transition a step to `running` and stamp `started_at`.
pub async fn mark_running(conn: &mut PgConnection, step_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE steps
        SET status = 'running', started_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(step_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Transition a step to `completed` with its outputs.
pub async fn mark_completed(
    conn: &mut PgConnection,
    step_id: Uuid,
    outputs: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE steps
        SET status = 'completed', outputs = $2, completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(step_id)
    .bind(outputs)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Transition a step to `failed` with its error payload.
pub async fn mark_failed(conn: &mut PgConnection, step_id: Uuid, error: &Value) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE steps
        SET status = 'failed', error = $2, completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(step_id)
    .bind(error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Attach a captured-logs artifact to a step.
pub async fn set_logs_artifact(pool: &PgPool, step_id: Uuid, artifact_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE steps SET logs_artifact_id = $2 WHERE id = $1")
        .bind(step_id)
        .bind(artifact_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// All steps of a run in ascending idx order.
pub async fn list_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepRecord>> {
    let sql = format!(
        "SELECT {} FROM steps WHERE run_id = $1 ORDER BY idx ASC",
        STEP_COLUMNS
    );
    let records = sqlx::query_as::<_, StepRecord>(&sql)
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(records)
}
