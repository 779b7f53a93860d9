// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations for the core schema.
//!
//! Products embedding xyn-core call [`ensure_schema`] at startup: with
//! auto-create on, pending migrations run; with it off, startup refuses to
//! proceed unless every required migration id is present in the ledger.

use sqlx::migrate::MigrateError;
use sqlx::PgPool;

use crate::config::CoreConfig;
use crate::error::{Result, XynError};

/// PostgreSQL migrator with all core migrations embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run all pending migrations. Safe to call repeatedly; applied migrations
/// are skipped.
pub async fn run(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Migration ids from the ledger that are missing from `required`.
pub async fn missing_migrations(pool: &PgPool, required: &[i64]) -> Result<Vec<i64>> {
    if required.is_empty() {
        return Ok(Vec::new());
    }
    let applied: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?;
    let missing = required
        .iter()
        .copied()
        .filter(|id| !applied.iter().any(|(version,)| version == id))
        .collect();
    Ok(missing)
}

/// Enforce the schema policy at boot.
///
/// Auto-create runs the embedded migrator. Otherwise the required migration
/// ids must all be present in the ledger or startup is refused.
pub async fn ensure_schema(pool: &PgPool, config: &CoreConfig) -> Result<()> {
    if config.auto_create_schema {
        tracing::info!("Running database migrations");
        run(pool).await.map_err(|e| XynError::TransientDb {
            detail: e.to_string(),
        })?;
        tracing::info!("Migrations complete");
        return Ok(());
    }

    let missing = missing_migrations(pool, &config.required_migrations).await?;
    if !missing.is_empty() {
        return Err(XynError::Validation {
            field: "XYN_REQUIRED_MIGRATIONS".to_string(),
            message: format!(
                "schema auto-create is off and migrations {:?} are not applied",
                missing
            ),
        });
    }
    Ok(())
}
