// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for xyn-core integration tests.
//!
//! Tests run against a real PostgreSQL database named by TEST_DATABASE_URL
//! and are skipped when it is not set. Tests within one binary serialize on
//! a shared lock because the queue is global state.

#![allow(dead_code)]

use std::sync::OnceLock;

use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use xyn_core::model::RunRecord;
use xyn_core::queue;
use xyn_core::store::packs::{self, NewPack};
use xyn_core::store::runs::{self, NewRun};

static DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialize tests that touch the global queue.
pub async fn db_lock() -> MutexGuard<'static, ()> {
    DB_LOCK.get_or_init(|| Mutex::new(())).lock().await
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Test context holding the database pool.
pub struct TestContext {
    pub pool: PgPool,
}

impl TestContext {
    /// Connect to the test database and ensure migrations are applied.
    pub async fn new() -> Option<Self> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        xyn_core::migrations::MIGRATOR.run(&pool).await.ok()?;
        Some(Self { pool })
    }

    /// Enqueue a run eligible immediately.
    pub async fn enqueue(&self, name: &str, priority: i32) -> RunRecord {
        let mut new = NewRun::new(name, json!({}));
        new.priority = priority;
        new.env_id = "test".to_string();
        runs::enqueue(&self.pool, new).await.expect("enqueue run")
    }

    /// Enqueue a run with full control over the NewRun fields.
    pub async fn enqueue_with(&self, new: NewRun) -> RunRecord {
        runs::enqueue(&self.pool, new).await.expect("enqueue run")
    }

    /// Claim runs until every target id is held, ignoring stale rows left by
    /// earlier aborted test processes.
    pub async fn claim_until(&self, worker_id: &str, targets: &[Uuid]) -> Vec<RunRecord> {
        let mut claimed = Vec::new();
        for _ in 0..50 {
            match queue::claim_one(&self.pool, worker_id, 30.0, "test")
                .await
                .expect("claim")
            {
                Some(run) if targets.contains(&run.id) => {
                    claimed.push(run);
                    if claimed.len() == targets.len() {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        claimed
    }

    /// Current status of a run.
    pub async fn run_status(&self, run_id: Uuid) -> Option<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .ok()?;
        row.map(|r| r.0)
    }

    /// Reload a run row.
    pub async fn reload(&self, run_id: Uuid) -> RunRecord {
        runs::get(&self.pool, run_id)
            .await
            .expect("get run")
            .expect("run exists")
    }

    /// Force a claimed run's lease into the past.
    pub async fn expire_lease(&self, run_id: Uuid) {
        sqlx::query(
            "UPDATE runs SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .expect("expire lease");
    }

    /// Hand a running row to a different worker, simulating a reclaim race.
    pub async fn steal_lock(&self, run_id: Uuid, thief: &str) {
        sqlx::query("UPDATE runs SET locked_by = $2 WHERE id = $1")
            .bind(run_id)
            .bind(thief)
            .execute(&self.pool)
            .await
            .expect("steal lock");
    }

    /// Event names for a correlation id in occurrence order.
    pub async fn event_names(&self, correlation_id: &str) -> Vec<String> {
        xyn_core::store::events::list_by_correlation(&self.pool, correlation_id)
            .await
            .expect("list events")
            .into_iter()
            .map(|e| e.event_name)
            .collect()
    }

    /// Seed (or refresh) a pack catalog entry.
    pub async fn seed_pack(&self, pack_ref: &str, version: &str, manifest: Value) -> Uuid {
        let pack = packs::upsert_pack(
            &self.pool,
            &NewPack {
                pack_ref: pack_ref.to_string(),
                name: pack_ref.split('@').next().unwrap_or(pack_ref).to_string(),
                version: version.to_string(),
                pack_type: "domain".to_string(),
                schema_name: None,
                manifest,
                dependencies: json!([]),
            },
        )
        .await
        .expect("seed pack");
        pack.id
    }

    /// Remove a run and everything hanging off it.
    pub async fn cleanup_run(&self, run_id: Uuid) {
        sqlx::query("DELETE FROM events WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("UPDATE steps SET logs_artifact_id = NULL WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM artifacts WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM steps WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM run_edges WHERE parent_run_id = $1 OR child_run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM pack_installations WHERE installed_by_run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM runs WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .ok();
    }
}
