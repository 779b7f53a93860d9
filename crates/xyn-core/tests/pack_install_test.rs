// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pack installation state machine tests: round-trip, conflict
//! classification, ownership, idempotent finalize, check-constraint
//! enforcement.

mod common;

use serde_json::json;
use uuid::Uuid;

use common::TestContext;
use xyn_core::blueprints::{builtin_registry, pack_install::PACK_INSTALL_REF};
use xyn_core::executor::{self, ExecutorConfig, RunOutcome};
use xyn_core::store::events::names;
use xyn_core::store::packs::{self, ClaimInstallation, FinalizeInstallation};
use xyn_core::store::runs::NewRun;

fn test_config(env_id: &str) -> ExecutorConfig {
    ExecutorConfig {
        env_id: env_id.to_string(),
        ..ExecutorConfig::default()
    }
}

fn demo_manifest() -> serde_json::Value {
    json!({
        "tables": [
            {
                "name": "things",
                "columns": [
                    { "name": "id", "type": "uuid", "primary_key": true },
                    { "name": "label", "type": "text", "nullable": false },
                ]
            }
        ],
        "migrations": [
            { "id": "0001_label_index", "description": "index on label",
              "sql": "CREATE INDEX IF NOT EXISTS ix_things_label ON pack_core_domain.things (label)" }
        ]
    })
}

async fn enqueue_install(ctx: &TestContext, pack_ref: &str, env_id: &str) -> xyn_core::model::RunRecord {
    let mut new = NewRun::new(PACK_INSTALL_REF, json!({ "pack_ref": pack_ref, "env_id": env_id }));
    new.priority = 5;
    new.env_id = env_id.to_string();
    new.max_attempts = Some(1);
    ctx.enqueue_with(new).await
}

#[tokio::test]
async fn test_pack_install_success_roundtrip() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    ctx.seed_pack("core.domain@v1", "1.0.0", demo_manifest()).await;

    let run = enqueue_install(&ctx, "core.domain@v1", &env_id).await;
    ctx.claim_until("w-install", &[run.id]).await;

    let registry = builtin_registry();
    let outcome =
        executor::execute_run(&ctx.pool, &registry, &test_config(&env_id), run.id, "w-install")
            .await
            .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let installation = packs::get_installation(&ctx.pool, "core.domain@v1", &env_id)
        .await
        .unwrap()
        .expect("installation row exists");
    assert_eq!(installation.status, "installed");
    assert_eq!(installation.installed_version.as_deref(), Some("1.0.0"));
    assert_eq!(installation.schema_name.as_deref(), Some("pack_core_domain"));
    assert_eq!(installation.installed_by_run_id, Some(run.id));
    assert_eq!(installation.migration_state.as_deref(), Some("0001_label_index"));
    assert!(installation.installed_at.is_some());
    assert!(installation.error.is_none());

    // The schema and its ledger exist.
    let (schema_exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = 'pack_core_domain')",
    )
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert!(schema_exists);

    let (ledger_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pack_core_domain.schema_migrations WHERE id = '0001_label_index'")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(ledger_count, 1);

    let events = ctx.event_names(&run.correlation_id).await;
    assert!(events.contains(&names::PACK_INSTALL_COMPLETED.to_string()));
    assert!(!events.contains(&names::PACK_INSTALL_FAILED.to_string()));

    // Five steps in order: validate, claim, provision, migrate, finalize.
    let steps = xyn_core::store::steps::list_for_run(&ctx.pool, run.id)
        .await
        .unwrap();
    assert_eq!(steps.len(), 5);
    assert!(steps.iter().all(|s| s.status == "completed"));

    ctx.cleanup_run(run.id).await;
}

#[tokio::test]
async fn test_replayed_install_conflicts_with_already_installed() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    ctx.seed_pack("core.domain@v1", "1.0.0", demo_manifest()).await;
    let registry = builtin_registry();

    let first = enqueue_install(&ctx, "core.domain@v1", &env_id).await;
    ctx.claim_until("w-one", &[first.id]).await;
    let outcome =
        executor::execute_run(&ctx.pool, &registry, &test_config(&env_id), first.id, "w-one")
            .await
            .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let installed = packs::get_installation(&ctx.pool, "core.domain@v1", &env_id)
        .await
        .unwrap()
        .unwrap();

    // Replay: the second run never claims the row and fails typed; the
    // installation row is not mutated.
    let second = enqueue_install(&ctx, "core.domain@v1", &env_id).await;
    ctx.claim_until("w-two", &[second.id]).await;
    let outcome =
        executor::execute_run(&ctx.pool, &registry, &test_config(&env_id), second.id, "w-two")
            .await
            .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let row = ctx.reload(second.id).await;
    let error = row.error.unwrap();
    assert_eq!(error["cause"]["kind"], "pack_already_installed");
    assert_eq!(
        error["cause"]["existing_installation_id"],
        json!(installed.id)
    );

    let untouched = packs::get_installation(&ctx.pool, "core.domain@v1", &env_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, "installed");
    assert_eq!(untouched.updated_at, installed.updated_at);

    ctx.cleanup_run(second.id).await;
    ctx.cleanup_run(first.id).await;
}

#[tokio::test]
async fn test_install_in_progress_conflict() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    let pack_id = ctx.seed_pack("test.locking@v1", "1.0.0", json!({})).await;

    // A holder run claims the installation and never finishes.
    let holder = ctx.enqueue("holder", 5).await;
    let mut conn = ctx.pool.acquire().await.unwrap();
    let claimed = packs::claim_installation(
        &mut conn,
        &ClaimInstallation {
            pack_id,
            pack_ref: "test.locking@v1",
            env_id: &env_id,
            schema_mode: "per_pack",
            schema_name: "pack_test_locking",
            run_id: holder.id,
        },
    )
    .await
    .unwrap()
    .expect("fresh claim succeeds");
    drop(conn);

    let run = enqueue_install(&ctx, "test.locking@v1", &env_id).await;
    ctx.claim_until("w-late", &[run.id]).await;
    let registry = builtin_registry();
    let outcome =
        executor::execute_run(&ctx.pool, &registry, &test_config(&env_id), run.id, "w-late")
            .await
            .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let row = ctx.reload(run.id).await;
    let error = row.error.unwrap();
    assert_eq!(error["cause"]["kind"], "installation_in_progress");
    assert_eq!(error["cause"]["existing_installation_id"], json!(claimed.id));
    assert_eq!(error["cause"]["existing_run_id"], json!(holder.id));

    ctx.cleanup_run(run.id).await;
    ctx.cleanup_run(holder.id).await;
}

#[tokio::test]
async fn test_previously_failed_conflict() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    let pack_id = ctx.seed_pack("test.failed@v1", "1.0.0", json!({})).await;

    let loser = ctx.enqueue("loser", 5).await;
    let mut conn = ctx.pool.acquire().await.unwrap();
    let claimed = packs::claim_installation(
        &mut conn,
        &ClaimInstallation {
            pack_id,
            pack_ref: "test.failed@v1",
            env_id: &env_id,
            schema_mode: "per_pack",
            schema_name: "pack_test_failed",
            run_id: loser.id,
        },
    )
    .await
    .unwrap()
    .unwrap();
    drop(conn);

    packs::mark_installation_failed(
        &ctx.pool,
        claimed.id,
        loser.id,
        &json!({ "kind": "migration_apply_failed", "message": "boom" }),
        &loser.correlation_id,
        "test",
        &env_id,
    )
    .await
    .unwrap();

    let run = enqueue_install(&ctx, "test.failed@v1", &env_id).await;
    ctx.claim_until("w-after", &[run.id]).await;
    let registry = builtin_registry();
    let outcome =
        executor::execute_run(&ctx.pool, &registry, &test_config(&env_id), run.id, "w-after")
            .await
            .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let row = ctx.reload(run.id).await;
    let error = row.error.unwrap();
    assert_eq!(error["cause"]["kind"], "installation_previously_failed");
    assert_eq!(error["cause"]["error_details"]["kind"], "migration_apply_failed");
    assert!(error["cause"]["last_error_at"].is_string());

    ctx.cleanup_run(run.id).await;
    ctx.cleanup_run(loser.id).await;
}

#[tokio::test]
async fn test_finalize_rejects_non_owner() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    let pack_id = ctx.seed_pack("test.owner@v1", "1.0.0", json!({})).await;

    let owner = ctx.enqueue("owner", 5).await;
    let interloper = ctx.enqueue("interloper", 5).await;

    let mut conn = ctx.pool.acquire().await.unwrap();
    let claimed = packs::claim_installation(
        &mut conn,
        &ClaimInstallation {
            pack_id,
            pack_ref: "test.owner@v1",
            env_id: &env_id,
            schema_mode: "per_pack",
            schema_name: "pack_test_owner",
            run_id: owner.id,
        },
    )
    .await
    .unwrap()
    .unwrap();
    drop(conn);

    let err = packs::finalize_installation(
        &ctx.pool,
        &FinalizeInstallation {
            installation_id: claimed.id,
            run_id: interloper.id,
            version: "1.0.0",
            migration_state: "init",
            correlation_id: &interloper.correlation_id,
            actor: "test",
            env_id: &env_id,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "ownership_violation");

    // The row is untouched.
    let row = packs::get_installation(&ctx.pool, "test.owner@v1", &env_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "installing");

    ctx.cleanup_run(interloper.id).await;
    ctx.cleanup_run(owner.id).await;
}

#[tokio::test]
async fn test_finalize_is_idempotent_for_the_owner() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    let pack_id = ctx.seed_pack("test.idem@v1", "1.0.0", json!({})).await;

    let owner = ctx.enqueue("idem-owner", 5).await;
    let mut conn = ctx.pool.acquire().await.unwrap();
    let claimed = packs::claim_installation(
        &mut conn,
        &ClaimInstallation {
            pack_id,
            pack_ref: "test.idem@v1",
            env_id: &env_id,
            schema_mode: "per_pack",
            schema_name: "pack_test_idem",
            run_id: owner.id,
        },
    )
    .await
    .unwrap()
    .unwrap();
    drop(conn);

    let finalize = FinalizeInstallation {
        installation_id: claimed.id,
        run_id: owner.id,
        version: "1.0.0",
        migration_state: "init",
        correlation_id: &owner.correlation_id,
        actor: "test",
        env_id: &env_id,
    };

    let first = packs::finalize_installation(&ctx.pool, &finalize).await.unwrap();
    assert_eq!(first.status, "installed");

    let second = packs::finalize_installation(&ctx.pool, &finalize).await.unwrap();
    assert_eq!(second.status, "installed");
    assert_eq!(second.updated_at, first.updated_at);

    ctx.cleanup_run(owner.id).await;
}

#[tokio::test]
async fn test_check_constraint_rejects_incomplete_installed_row() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };
    let _guard = common::db_lock().await;

    let env_id = format!("test-{}", Uuid::new_v4());
    let pack_id = ctx.seed_pack("test.invariant@v1", "1.0.0", json!({})).await;

    let owner = ctx.enqueue("invariant-owner", 5).await;
    let mut conn = ctx.pool.acquire().await.unwrap();
    let claimed = packs::claim_installation(
        &mut conn,
        &ClaimInstallation {
            pack_id,
            pack_ref: "test.invariant@v1",
            env_id: &env_id,
            schema_mode: "per_pack",
            schema_name: "pack_test_invariant",
            run_id: owner.id,
        },
    )
    .await
    .unwrap()
    .unwrap();
    drop(conn);

    // Direct SQL flipping to installed without the provenance fields must be
    // rejected by the check constraint (installed_version stays NULL).
    let result = sqlx::query("UPDATE pack_installations SET status = 'installed' WHERE id = $1")
        .bind(claimed.id)
        .execute(&ctx.pool)
        .await;
    let err = result.expect_err("check constraint must reject the update");
    let message = err.to_string();
    assert!(
        message.contains("ck_pack_installations_installed_invariants"),
        "unexpected error: {}",
        message
    );

    ctx.cleanup_run(owner.id).await;
}
