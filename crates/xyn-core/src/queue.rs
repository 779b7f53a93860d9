// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue/lease engine: claim, renew, reclaim, finalize, retry, cancel.
//!
//! The relational store is the only coordination substrate. Every transition
//! here is a single short transaction; the event recording the transition
//! commits with it. Row locks never outlive one statement batch.
//!
//! Ownership is compare-and-swap: finalizing updates carry
//! `status = 'running' AND locked_by = $worker` so a worker that lost its
//! lease cannot write terminal state.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::backoff::BackoffConfig;
use crate::error::{Result, XynError};
use crate::model::{RunRecord, RunStatus};
use crate::store::events::{self, names, NewEvent};
use crate::store::runs::RUN_COLUMNS;

/// Claim exactly one due run for this worker.
///
/// A single atomic statement: the candidate select takes `FOR UPDATE SKIP
/// LOCKED` so concurrent claimers never block on, or double-claim, the same
/// row. Tie-breaks are deterministic: priority, then `run_at`, `queued_at`,
/// `created_at`. The attempt counter increments on every claim, so reclaimed
/// zombies count as attempts.
///
/// `xyn.run.started` commits in the same transaction; on a reclaimed run
/// (attempt > 1) it carries `data.reclaimed = true`.
pub async fn claim_one(
    pool: &PgPool,
    worker_id: &str,
    lease_seconds: f64,
    env_id: &str,
) -> Result<Option<RunRecord>> {
    let sql = format!(
        r#"
        WITH candidate AS (
            SELECT id
            FROM runs
            WHERE status = 'queued' AND run_at <= NOW()
            ORDER BY priority ASC, run_at ASC, queued_at ASC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE runs r
        SET status = 'running',
            locked_at = NOW(),
            locked_by = $1,
            lease_expires_at = NOW() + make_interval(secs => $2),
            started_at = COALESCE(r.started_at, NOW()),
            attempt = r.attempt + 1
        FROM candidate
        WHERE r.id = candidate.id
        RETURNING {}
        "#,
        RUN_COLUMNS
    );

    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(run) = claimed else {
        tx.commit().await?;
        return Ok(None);
    };

    let reclaimed = run.attempt > 1;
    let mut event = NewEvent::new(names::RUN_STARTED, &run.correlation_id);
    event.env_id = env_id.to_string();
    event.actor = run.actor.clone();
    event.run_id = Some(run.id);
    event.resource_type = Some("run".to_string());
    event.resource_id = Some(run.id.to_string());
    event.data = json!({
        "attempt": run.attempt,
        "worker_id": worker_id,
        "reclaimed": reclaimed,
    });
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;

    tracing::info!(
        run_id = %run.id,
        name = %run.name,
        attempt = run.attempt,
        reclaimed,
        correlation_id = %run.correlation_id,
        "Claimed run"
    );

    Ok(Some(run))
}

/// Extend the lease on a run this worker still owns.
///
/// Returns `false` when zero rows matched: the worker has lost the lease and
/// MUST abort the run locally without further state writes.
pub async fn renew_lease(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    lease_seconds: f64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET lease_expires_at = NOW() + make_interval(secs => $3)
        WHERE id = $1
          AND locked_by = $2
          AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(worker_id)
    .bind(lease_seconds)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        tracing::warn!(
            run_id = %run_id,
            worker_id,
            "Lost lease ownership, another worker may have reclaimed the run"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Return all expired `running` rows to the queue.
///
/// Any worker may run this; the prior attempt stays consumed (the counter
/// increments again on the next claim). Emits `xyn.run.reclaimed` per row in
/// the same transaction.
pub async fn reclaim_expired(pool: &PgPool, env_id: &str) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await?;

    let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
        r#"
        UPDATE runs
        SET status = 'queued',
            locked_at = NULL,
            locked_by = NULL,
            lease_expires_at = NULL
        WHERE status = 'running' AND lease_expires_at < NOW()
        RETURNING id, correlation_id, actor
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    for (id, correlation_id, actor) in &rows {
        let mut event = NewEvent::new(names::RUN_RECLAIMED, correlation_id);
        event.env_id = env_id.to_string();
        event.actor = actor.clone();
        event.run_id = Some(*id);
        event.resource_type = Some("run".to_string());
        event.resource_id = Some(id.to_string());
        events::emit(&mut *tx, event).await?;
    }

    tx.commit().await?;

    let ids: Vec<Uuid> = rows.into_iter().map(|(id, _, _)| id).collect();
    if !ids.is_empty() {
        tracing::warn!(count = ids.len(), "Reclaimed expired leases");
    }
    Ok(ids)
}

/// Outcome of a compare-and-swap finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The terminal state was written.
    Applied,
    /// Zero rows matched; this worker no longer owns the run.
    LostLease,
}

/// Finalize a run as `completed` with its outputs.
pub async fn finalize_completed(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    outputs: &Value,
    env_id: &str,
) -> Result<FinalizeOutcome> {
    finalize(
        pool,
        run_id,
        worker_id,
        TerminalState::Completed { outputs },
        env_id,
    )
    .await
}

/// Finalize a run as `failed` with its error payload. Terminal; the retry
/// policy was already consulted by the caller.
pub async fn finalize_failed(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    error: &Value,
    env_id: &str,
) -> Result<FinalizeOutcome> {
    finalize(pool, run_id, worker_id, TerminalState::Failed { error }, env_id).await
}

/// Finalize a run as `cancelled` after the executor observed the flag.
pub async fn finalize_cancelled(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    env_id: &str,
) -> Result<FinalizeOutcome> {
    finalize(pool, run_id, worker_id, TerminalState::Cancelled, env_id).await
}

enum TerminalState<'a> {
    Completed { outputs: &'a Value },
    Failed { error: &'a Value },
    Cancelled,
}

async fn finalize(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    state: TerminalState<'_>,
    env_id: &str,
) -> Result<FinalizeOutcome> {
    let (status, event_name, payload) = match &state {
        TerminalState::Completed { outputs } => (
            "completed",
            names::RUN_COMPLETED,
            json!({ "outputs": outputs }),
        ),
        TerminalState::Failed { error } => ("failed", names::RUN_FAILED, json!({ "error": error })),
        TerminalState::Cancelled => ("cancelled", names::RUN_CANCELLED, json!({})),
    };
    let outputs: Option<Value> = match &state {
        TerminalState::Completed { outputs } => Some((*outputs).clone()),
        _ => None,
    };
    let error: Option<Value> = match &state {
        TerminalState::Failed { error } => Some((*error).clone()),
        _ => None,
    };

    let sql = format!(
        r#"
        UPDATE runs
        SET status = $3,
            completed_at = NOW(),
            outputs = COALESCE($4, outputs),
            error = COALESCE($5, error)
        WHERE id = $1
          AND status = 'running'
          AND locked_by = $2
          AND lease_expires_at > NOW()
        RETURNING {}
        "#,
        RUN_COLUMNS
    );

    let mut tx = pool.begin().await?;

    let updated = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(run_id)
        .bind(worker_id)
        .bind(status)
        .bind(outputs)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(run) = updated else {
        tx.commit().await?;
        tracing::warn!(run_id = %run_id, status, "Lost ownership while finalizing run");
        return Ok(FinalizeOutcome::LostLease);
    };

    let mut event = NewEvent::new(event_name, &run.correlation_id);
    event.env_id = env_id.to_string();
    event.actor = run.actor.clone();
    event.run_id = Some(run.id);
    event.resource_type = Some("run".to_string());
    event.resource_id = Some(run.id.to_string());
    event.data = payload;
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;

    tracing::info!(run_id = %run.id, status, correlation_id = %run.correlation_id, "Finalized run");
    Ok(FinalizeOutcome::Applied)
}

/// Outcome of delegating a terminal step failure to the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The run went back to the queue with a backoff delay.
    Retried {
        /// When the run becomes claimable again.
        next_run_at: DateTime<Utc>,
    },
    /// The run failed terminally.
    Failed,
    /// Zero rows matched; this worker no longer owns the run.
    LostLease,
}

/// Apply the retry policy to a failed run.
///
/// Retry while `max_attempts` is NULL or `attempt < max_attempts`:
/// back to `queued` with `run_at = now + backoff(attempt)` (full jitter) and
/// cleared lease fields. Otherwise terminal `failed`.
pub async fn fail_or_retry(
    pool: &PgPool,
    run: &RunRecord,
    worker_id: &str,
    error: &Value,
    backoff: &BackoffConfig,
    env_id: &str,
) -> Result<FailOutcome> {
    let attempt = run.attempt.max(1) as u32;
    let retryable = match run.max_attempts {
        None => true,
        Some(max) => run.attempt < max,
    };

    if !retryable {
        return match finalize_failed(pool, run.id, worker_id, error, env_id).await? {
            FinalizeOutcome::Applied => Ok(FailOutcome::Failed),
            FinalizeOutcome::LostLease => Ok(FailOutcome::LostLease),
        };
    }

    let delay = backoff.delay(attempt);

    let mut tx = pool.begin().await?;

    let updated: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        r#"
        UPDATE runs
        SET status = 'queued',
            run_at = NOW() + make_interval(secs => $3),
            locked_at = NULL,
            locked_by = NULL,
            lease_expires_at = NULL
        WHERE id = $1
          AND status = 'running'
          AND locked_by = $2
        RETURNING id, run_at
        "#,
    )
    .bind(run.id)
    .bind(worker_id)
    .bind(delay.as_secs_f64())
    .fetch_optional(&mut *tx)
    .await?;

    let Some((_, next_run_at)) = updated else {
        tx.commit().await?;
        tracing::warn!(run_id = %run.id, "Lost ownership while scheduling retry");
        return Ok(FailOutcome::LostLease);
    };

    let mut event = NewEvent::new(names::RUN_RETRY_SCHEDULED, &run.correlation_id);
    event.env_id = env_id.to_string();
    event.actor = run.actor.clone();
    event.run_id = Some(run.id);
    event.resource_type = Some("run".to_string());
    event.resource_id = Some(run.id.to_string());
    event.data = json!({
        "attempt": run.attempt,
        "max_attempts": run.max_attempts,
        "delay_ms": delay.as_millis() as u64,
        "next_run_at": next_run_at,
        "error": error,
    });
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;

    tracing::info!(
        run_id = %run.id,
        attempt = run.attempt,
        delay_ms = delay.as_millis() as u64,
        "Scheduled run retry"
    );
    Ok(FailOutcome::Retried { next_run_at })
}

/// Cancel a run.
///
/// A `queued` run is cancelled immediately; a `running` run gets the
/// cooperative flag and transitions at the executor's next step boundary.
/// Terminal runs are returned unchanged, making the operation idempotent.
pub async fn cancel(pool: &PgPool, run_id: Uuid, env_id: &str) -> Result<RunRecord> {
    let lock_sql = format!("SELECT {} FROM runs WHERE id = $1 FOR UPDATE", RUN_COLUMNS);
    let update_sql = format!(
        r#"
        UPDATE runs
        SET status = 'cancelled', completed_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        RUN_COLUMNS
    );

    let mut tx = pool.begin().await?;

    let run = sqlx::query_as::<_, RunRecord>(&lock_sql)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(XynError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;

    let result = match run.run_status() {
        Some(RunStatus::Queued) => {
            let cancelled = sqlx::query_as::<_, RunRecord>(&update_sql)
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?;

            let mut event = NewEvent::new(names::RUN_CANCELLED, &cancelled.correlation_id);
            event.env_id = env_id.to_string();
            event.actor = cancelled.actor.clone();
            event.run_id = Some(cancelled.id);
            event.resource_type = Some("run".to_string());
            event.resource_id = Some(cancelled.id.to_string());
            events::emit(&mut *tx, event).await?;
            cancelled
        }
        Some(RunStatus::Running) => {
            sqlx::query("UPDATE runs SET cancel_requested = TRUE WHERE id = $1")
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
            let refreshed = sqlx::query_as::<_, RunRecord>(&format!(
                "SELECT {} FROM runs WHERE id = $1",
                RUN_COLUMNS
            ))
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;
            tracing::info!(run_id = %run_id, "Cancellation requested for running run");
            refreshed
        }
        _ => run,
    };

    tx.commit().await?;
    Ok(result)
}
