// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Xyn API - HTTP server process
//!
//! Serves the /api/v1 surface and, by default, colocates worker slots, the
//! reclaim loop and the metrics collector so a single process is a complete
//! deployment. Set `XYN_EMBEDDED_WORKERS=0` to run workers separately.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use xyn_api::config::ApiConfig;
use xyn_api::routes;
use xyn_api::state::ApiState;
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
                .add_directive("xyn_api=info".parse().unwrap())
                .add_directive("xyn_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Xyn API");

    let core_config = CoreConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let api_config = ApiConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        bind_addr = %api_config.bind_addr,
        env_id = %core_config.env_id,
        embedded_workers = api_config.embedded_workers,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&core_config.database_url)
        .await?;

    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    migrations::ensure_schema(&pool, &core_config).await?;

    // Metrics recorder must be installed before any gauge writes.
    xyn_api::metrics::init_metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    background.push(tokio::spawn(collector::run(
        pool.clone(),
        core_config.metrics_interval,
        shutdown_rx.clone(),
    )));

    let reclaim_config = core_config.clone();
    let reclaim_pool = pool.clone();
    let reclaim_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        worker::reclaim_loop(reclaim_pool, &reclaim_config, reclaim_shutdown).await;
    }));

    if api_config.embedded_workers > 0 {
        let registry = Arc::new(blueprints::builtin_registry());
        info!(blueprints = ?registry.references(), "Registered blueprints");
        for slot in 0..api_config.embedded_workers {
            let slot_worker = Worker::new(pool.clone(), registry.clone(), &core_config, slot);
            let slot_shutdown = shutdown_rx.clone();
            background.push(tokio::spawn(async move {
                slot_worker.run(slot_shutdown).await;
            }));
        }
    }

    let state = ApiState::new(pool.clone(), core_config.env_id.clone());
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(api_config.bind_addr).await?;
    info!(addr = %api_config.bind_addr, "Xyn API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("Shutting down...");
    shutdown_tx.send(true).ok();
    for handle in background {
        handle.await.ok();
    }

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
