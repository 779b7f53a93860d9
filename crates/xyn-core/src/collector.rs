// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metrics collector: periodic gauge updates over the runs table.
//!
//! A single cooperative task, independent of workers. Each tick acquires an
//! ephemeral session, runs four indexed queries, updates the process-local
//! gauges and releases the session. Tick failures are logged and never stall
//! subsequent ticks. Counts that drop to zero are written as 0, not left at
//! their previous value.

use std::time::Duration;

use metrics::gauge;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::error::Result;
use crate::metrics::{
    QUEUE_DEPTH, QUEUE_FUTURE_DEPTH, QUEUE_OLDEST_READY_SECONDS, QUEUE_READY_DEPTH,
    RUNNING_WITH_ACTIVE_LEASE, RUNNING_WITH_EXPIRED_LEASE,
};
use crate::model::RunStatus;

/// Run the collector until shutdown is signalled.
pub async fn run(pool: PgPool, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(interval_seconds = interval.as_secs(), "Starting metrics collector");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = collect_once(&pool).await {
                    tracing::warn!(error = %err, "Metrics collector tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Metrics collector shutting down");
                    return;
                }
            }
        }
    }
}

/// Execute all gauge queries in one ephemeral session.
pub async fn collect_once(pool: &PgPool) -> Result<()> {
    let mut conn = pool.acquire().await?;

    // 1) Queue depth by status. Uses ix_runs_status. Statuses with no rows
    //    reset to zero so the gauge never reports a stale count.
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*)::bigint
        FROM runs
        GROUP BY status
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for status in RunStatus::ALL {
        let count = rows
            .iter()
            .find(|(s, _)| s == status.as_str())
            .map(|(_, c)| *c)
            .unwrap_or(0);
        gauge!(QUEUE_DEPTH, "status" => status.as_str()).set(count as f64);
    }

    // 2) Ready vs future queued runs. Uses ix_runs_status, ix_runs_run_at.
    let (ready, future): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'queued' AND run_at <= NOW()),
            COUNT(*) FILTER (WHERE status = 'queued' AND run_at > NOW())
        FROM runs
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    gauge!(QUEUE_READY_DEPTH).set(ready as f64);
    gauge!(QUEUE_FUTURE_DEPTH).set(future as f64);

    // 3) Oldest ready run age. Uses ix_runs_claim_order.
    let (age_seconds,): (Option<f64>,) = sqlx::query_as(
        r#"
        SELECT EXTRACT(EPOCH FROM (NOW() - MIN(queued_at)))::double precision
        FROM runs
        WHERE status = 'queued' AND run_at <= NOW()
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    gauge!(QUEUE_OLDEST_READY_SECONDS).set(age_seconds.unwrap_or(0.0));

    // 4) Lease health. Uses ix_runs_lease_expiry.
    let (expired, active): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE lease_expires_at < NOW()),
            COUNT(*) FILTER (WHERE lease_expires_at >= NOW())
        FROM runs
        WHERE status = 'running' AND lease_expires_at IS NOT NULL
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    gauge!(RUNNING_WITH_EXPIRED_LEASE).set(expired as f64);
    gauge!(RUNNING_WITH_ACTIVE_LEASE).set(active as f64);

    Ok(())
}
