// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue/lease engine integration tests: claim ordering, double-claim
//! exclusion, reclaim, retry scheduling, cancellation.

mod common;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use common::TestContext;
use xyn_core::backoff::BackoffConfig;
use xyn_core::queue::{self, FailOutcome, FinalizeOutcome};
use xyn_core::store::events::names;
use xyn_core::store::runs::NewRun;

#[tokio::test]
async fn test_claim_orders_by_priority() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let low = ctx.enqueue("priority-low", 100).await;
    let high = ctx.enqueue("priority-high", 10).await;
    let mid = ctx.enqueue("priority-mid", 50).await;
    let targets = [low.id, high.id, mid.id];

    let claimed = ctx.claim_until("w-order", &targets).await;
    let order: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
    assert_eq!(order, vec![high.id, mid.id, low.id]);

    for run in &claimed {
        assert_eq!(run.status, "running");
        assert_eq!(run.attempt, 1);
        assert_eq!(run.locked_by.as_deref(), Some("w-order"));
        assert!(run.lease_expires_at.is_some());
        assert!(run.started_at.is_some());
    }

    for id in targets {
        ctx.cleanup_run(id).await;
    }
}

#[tokio::test]
async fn test_claim_skips_future_runs() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let mut new = NewRun::new("scheduled-later", json!({}));
    new.run_at = Some(Utc::now() + chrono::Duration::hours(1));
    let future = ctx.enqueue_with(new).await;

    let claimed = ctx.claim_until("w-future", &[future.id]).await;
    assert!(claimed.is_empty());
    assert_eq!(ctx.run_status(future.id).await.as_deref(), Some("queued"));

    ctx.cleanup_run(future.id).await;
}

#[tokio::test]
async fn test_no_double_claim_under_concurrency() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let mut targets = Vec::new();
    for i in 0..3 {
        targets.push(ctx.enqueue(&format!("concurrent-{}", i), 5).await.id);
    }

    // Three claimers race over the same rows; each row lands with exactly one.
    let pool = ctx.pool.clone();
    let claim_all = |worker: String| {
        let pool = pool.clone();
        let targets = targets.clone();
        async move {
            let mut mine = Vec::new();
            loop {
                match queue::claim_one(&pool, &worker, 30.0, "test").await.unwrap() {
                    Some(run) if targets.contains(&run.id) => mine.push(run.id),
                    Some(_) => {}
                    None => break,
                }
            }
            mine
        }
    };

    let (a, b, c) = tokio::join!(
        claim_all("w-a".to_string()),
        claim_all("w-b".to_string()),
        claim_all("w-c".to_string())
    );

    let mut all: Vec<Uuid> = a.iter().chain(b.iter()).chain(c.iter()).copied().collect();
    all.sort();
    let mut expected = targets.clone();
    expected.sort();
    assert_eq!(all, expected, "every row claimed exactly once");

    for id in targets {
        ctx.cleanup_run(id).await;
    }
}

#[tokio::test]
async fn test_renew_lease_and_lost_ownership() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let run = ctx.enqueue("renewal", 5).await;
    let claimed = ctx.claim_until("w-owner", &[run.id]).await;
    assert_eq!(claimed.len(), 1);

    // A stranger cannot renew; the owner can.
    assert!(!queue::renew_lease(&ctx.pool, run.id, "w-stranger", 30.0)
        .await
        .unwrap());
    assert!(queue::renew_lease(&ctx.pool, run.id, "w-owner", 30.0)
        .await
        .unwrap());

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_reclaim_expired_lease_and_attempt_counter() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let run = ctx.enqueue("zombie", 5).await;
    let claimed = ctx.claim_until("w-crashed", &[run.id]).await;
    assert_eq!(claimed[0].attempt, 1);

    ctx.expire_lease(run.id).await;
    let reclaimed = queue::reclaim_expired(&ctx.pool, "test").await.unwrap();
    assert!(reclaimed.contains(&run.id));

    let row = ctx.reload(run.id).await;
    assert_eq!(row.status, "queued");
    assert!(row.locked_by.is_none());
    assert!(row.lease_expires_at.is_none());

    // Reclaimed rows are re-claimable and the prior attempt stays consumed.
    let second_claims = ctx.claim_until("w-second", &[run.id]).await;
    assert_eq!(second_claims[0].attempt, 2);

    let events = xyn_core::store::events::list_by_correlation(&ctx.pool, &run.correlation_id)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_name == names::RUN_RECLAIMED));
    let second_start = events
        .iter()
        .filter(|e| e.event_name == names::RUN_STARTED)
        .last()
        .unwrap();
    assert_eq!(second_start.data["reclaimed"], json!(true));

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_retry_schedules_with_jittered_backoff() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let mut new = NewRun::new("retryable", json!({}));
    new.priority = 5;
    new.max_attempts = Some(3);
    let run = ctx.enqueue_with(new).await;
    let claimed = ctx.claim_until("w-retry", &[run.id]).await;

    let before = Utc::now();
    let outcome = queue::fail_or_retry(
        &ctx.pool,
        &claimed[0],
        "w-retry",
        &json!({ "kind": "step_handler_error", "message": "boom" }),
        &BackoffConfig::default(),
        "test",
    )
    .await
    .unwrap();

    // Attempt 1: full jitter in [0, 1s]; allow clock skew slack.
    let FailOutcome::Retried { next_run_at } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };
    let delay = next_run_at - before;
    assert!(delay >= chrono::Duration::seconds(-1));
    assert!(delay <= chrono::Duration::seconds(2), "delay was {:?}", delay);

    let row = ctx.reload(run.id).await;
    assert_eq!(row.status, "queued");
    assert!(row.locked_by.is_none());
    assert!(row.lease_expires_at.is_none());

    let events = ctx.event_names(&run.correlation_id).await;
    assert!(events.contains(&names::RUN_RETRY_SCHEDULED.to_string()));

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_retry_exhaustion_fails_terminally() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let mut new = NewRun::new("no-retries-left", json!({}));
    new.priority = 5;
    new.max_attempts = Some(1);
    let run = ctx.enqueue_with(new).await;
    let claimed = ctx.claim_until("w-final", &[run.id]).await;

    let outcome = queue::fail_or_retry(
        &ctx.pool,
        &claimed[0],
        "w-final",
        &json!({ "kind": "step_handler_error", "message": "boom" }),
        &BackoffConfig::default(),
        "test",
    )
    .await
    .unwrap();
    assert_eq!(outcome, FailOutcome::Failed);

    let row = ctx.reload(run.id).await;
    assert_eq!(row.status, "failed");
    assert!(row.completed_at.is_some());
    assert!(row.error.is_some());

    let events = ctx.event_names(&run.correlation_id).await;
    assert!(events.contains(&names::RUN_FAILED.to_string()));

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_cancel_queued_is_immediate_and_idempotent() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let run = ctx.enqueue("cancel-me", 5).await;

    let cancelled = queue::cancel(&ctx.pool, run.id, "test").await.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert!(cancelled.completed_at.is_some());

    // Second cancel is a no-op on a terminal row.
    let again = queue::cancel(&ctx.pool, run.id, "test").await.unwrap();
    assert_eq!(again.status, "cancelled");
    assert_eq!(again.completed_at, cancelled.completed_at);

    let events = ctx.event_names(&run.correlation_id).await;
    assert_eq!(
        events
            .iter()
            .filter(|name| name.as_str() == names::RUN_CANCELLED)
            .count(),
        1
    );

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_cancel_running_sets_cooperative_flag() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let run = ctx.enqueue("cancel-running", 5).await;
    ctx.claim_until("w-cancel", &[run.id]).await;

    let result = queue::cancel(&ctx.pool, run.id, "test").await.unwrap();
    assert_eq!(result.status, "running");
    assert!(result.cancel_requested);

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_finalize_after_lost_lease_writes_nothing() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let run = ctx.enqueue("stolen", 5).await;
    ctx.claim_until("w-victim", &[run.id]).await;
    ctx.steal_lock(run.id, "w-thief").await;

    let outcome =
        queue::finalize_completed(&ctx.pool, run.id, "w-victim", &json!({"ok": true}), "test")
            .await
            .unwrap();
    assert_eq!(outcome, FinalizeOutcome::LostLease);

    let row = ctx.reload(run.id).await;
    assert_eq!(row.status, "running");
    assert!(row.outputs.is_none());

    ctx.cleanup_run(run.id).await;
}
