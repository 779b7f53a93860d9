// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker loop: claim runs, execute them, keep the lease alive.
//!
//! A worker hosts one run at a time; parallelism comes from running several
//! worker slots, each with independent database sessions. Lease renewal runs
//! as a sibling task on its own ephemeral connections; if it observes a lost
//! lease it stops, and the executor's ownership guards abort the run at the
//! next boundary without state writes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::blueprints::BlueprintRegistry;
use crate::config::CoreConfig;
use crate::executor::{self, ExecutorConfig};
use crate::queue;

/// A claim-and-execute worker slot.
pub struct Worker {
    pool: PgPool,
    registry: Arc<BlueprintRegistry>,
    executor_config: ExecutorConfig,
    worker_id: String,
    lease_duration: Duration,
    idle_poll: Duration,
    env_id: String,
}

impl Worker {
    /// Build a worker slot from the core configuration.
    ///
    /// `slot` distinguishes colocated slots inside one process; each slot is
    /// its own claimant with its own `locked_by` identity.
    pub fn new(
        pool: PgPool,
        registry: Arc<BlueprintRegistry>,
        config: &CoreConfig,
        slot: usize,
    ) -> Self {
        let worker_id = if slot == 0 {
            config.worker_id.clone()
        } else {
            format!("{}-{}", config.worker_id, slot)
        };
        Self {
            pool,
            registry,
            executor_config: ExecutorConfig::from_core(config),
            worker_id,
            lease_duration: config.lease_duration,
            idle_poll: config.idle_poll,
            env_id: config.env_id.clone(),
        }
    }

    /// Worker identity stamped on `locked_by`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run the claim/execute loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.worker_id,
            lease_seconds = self.lease_duration.as_secs(),
            idle_poll_ms = self.idle_poll.as_millis() as u64,
            "Worker started"
        );

        while !*shutdown.borrow() {
            let claimed = queue::claim_one(
                &self.pool,
                &self.worker_id,
                self.lease_duration.as_secs_f64(),
                &self.env_id,
            )
            .await;

            match claimed {
                Ok(Some(run)) => {
                    self.execute_claimed(run.id).await;
                }
                Ok(None) => {
                    // No work; sleep with jitter so colocated slots spread out.
                    let sleep = self.idle_sleep();
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(worker_id = %self.worker_id, error = %err, "Claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Worker shutting down");
    }

    /// Idle interval with random jitter up to 50%.
    fn idle_sleep(&self) -> Duration {
        let base = self.idle_poll.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    async fn execute_claimed(&self, run_id: Uuid) {
        let renewal = tokio::spawn(periodic_lease_renewal(
            self.pool.clone(),
            run_id,
            self.worker_id.clone(),
            self.lease_duration,
        ));

        let outcome = executor::execute_run(
            &self.pool,
            &self.registry,
            &self.executor_config,
            run_id,
            &self.worker_id,
        )
        .await;

        renewal.abort();

        match outcome {
            Ok(outcome) => {
                tracing::info!(worker_id = %self.worker_id, run_id = %run_id, ?outcome, "Run finished");
            }
            Err(err) => {
                tracing::error!(worker_id = %self.worker_id, run_id = %run_id, error = %err, "Run execution errored");
            }
        }
    }
}

/// Renew the lease on an interval of `lease / 3` using ephemeral sessions.
///
/// Stops when ownership is lost; the executor notices via its own guards.
async fn periodic_lease_renewal(
    pool: PgPool,
    run_id: Uuid,
    worker_id: String,
    lease_duration: Duration,
) {
    let interval = lease_duration / 3;
    loop {
        tokio::time::sleep(interval).await;
        match queue::renew_lease(&pool, run_id, &worker_id, lease_duration.as_secs_f64()).await {
            Ok(true) => {
                tracing::debug!(run_id = %run_id, "Renewed lease");
            }
            Ok(false) => {
                tracing::error!(
                    run_id = %run_id,
                    worker_id = %worker_id,
                    "Lost run ownership during execution, stopping renewal"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "Lease renewal failed");
            }
        }
    }
}

/// Reclaim expired leases on a fixed cadence (half the lease duration).
///
/// Any process may run this; it is cheap when nothing expired.
pub async fn reclaim_loop(pool: PgPool, config: &CoreConfig, mut shutdown: watch::Receiver<bool>) {
    let interval = config.lease_duration / 2;
    let env_id = config.env_id.clone();
    tracing::info!(interval_seconds = interval.as_secs(), "Starting reclaim loop");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue::reclaim_expired(&pool, &env_id).await {
                    Ok(ids) if !ids.is_empty() => {
                        tracing::info!(count = ids.len(), "Reclaimed runs back to the queue");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "Reclaim pass failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Reclaim loop shutting down");
                    return;
                }
            }
        }
    }
}
