// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Xyn Worker - queue worker process
//!
//! The worker is responsible for:
//! - Claiming due runs and executing their blueprints
//! - Keeping leases alive while runs execute
//! - Reclaiming expired leases left by crashed workers
//! - Updating queue/lease gauges on a fixed cadence
//!
//! The HTTP surface lives in xyn-api, which can also colocate worker slots
//! for single-process deployments.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use xyn_core::blueprints;
use xyn_core::collector;
use xyn_core::config::CoreConfig;
use xyn_core::migrations;
use xyn_core::worker::{self, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xyn_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Xyn worker");

    let config = CoreConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let slots: usize = std::env::var("XYN_WORKER_SLOTS")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1)
        .max(1);

    info!(
        worker_id = %config.worker_id,
        env_id = %config.env_id,
        lease_seconds = config.lease_duration.as_secs(),
        slots,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    migrations::ensure_schema(&pool, &config).await?;

    let registry = Arc::new(blueprints::builtin_registry());
    info!(
        blueprints = ?registry.references(),
        "Registered blueprints"
    );

    xyn_core::metrics::describe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Metrics collector on its own cadence
    let collector_handle = tokio::spawn(collector::run(
        pool.clone(),
        config.metrics_interval,
        shutdown_rx.clone(),
    ));

    // Reclaim expired leases left by crashed workers
    let reclaim_config = config.clone();
    let reclaim_pool = pool.clone();
    let reclaim_shutdown = shutdown_rx.clone();
    let reclaim_handle = tokio::spawn(async move {
        worker::reclaim_loop(reclaim_pool, &reclaim_config, reclaim_shutdown).await;
    });

    // Worker slots
    let mut worker_handles = Vec::with_capacity(slots);
    for slot in 0..slots {
        let slot_worker = Worker::new(pool.clone(), registry.clone(), &config, slot);
        let slot_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            slot_worker.run(slot_shutdown).await;
        }));
    }

    info!("Xyn worker initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown_tx.send(true).ok();

    for handle in worker_handles {
        handle.await.ok();
    }
    reclaim_handle.await.ok();
    collector_handle.await.ok();

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
