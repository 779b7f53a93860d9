// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pack installation blueprint.
//!
//! Claim-insert, work, finalize-with-row-lock. The claim stamps
//! `installed_by_run_id`, so even under split-brain leases only one run can
//! finalize: the loser fails either the `locked_by` renewal check or the
//! ownership check inside the finalize critical section. On any failure
//! after a successful claim the row is left in `failed` with the error
//! payload and `last_error_at` for later inspection.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::Blueprint;
use crate::error::{Result, XynError};
use crate::executor::RunContext;
use crate::model::StepKind;
use crate::store::packs::{
    self, build_create_table_sql, normalize_schema_name, quote_ident, validate_column_type,
    validate_identifier, ClaimInstallation, FinalizeInstallation, PackManifest,
};

/// Reference under which the installer is registered.
pub const PACK_INSTALL_REF: &str = "core.pack.install@v1";

/// The pack installation state machine as a blueprint.
#[derive(Debug)]
pub struct PackInstallBlueprint;

#[async_trait]
impl Blueprint for PackInstallBlueprint {
    async fn run(&self, ctx: &mut RunContext, inputs: &Value) -> Result<Value> {
        let pack_ref = inputs
            .get("pack_ref")
            .and_then(Value::as_str)
            .ok_or_else(|| XynError::Validation {
                field: "pack_ref".to_string(),
                message: "pack_ref is required".to_string(),
            })?
            .to_string();
        let env_id = inputs
            .get("env_id")
            .and_then(Value::as_str)
            .unwrap_or(ctx.env_id())
            .to_string();

        let mut claimed: Option<Uuid> = None;
        match install(ctx, &pack_ref, &env_id, &mut claimed).await {
            Ok(outputs) => Ok(outputs),
            Err(XynError::LostLease { run_id }) => {
                // No state writes without the lease; reclaim will restore the run.
                Err(XynError::LostLease { run_id })
            }
            Err(err) => {
                // The claim-conflict errors mean another run owns the row;
                // only a row we claimed ourselves records our failure.
                if let Some(installation_id) = claimed {
                    let payload = err.payload();
                    if let Err(mark_err) = packs::mark_installation_failed(
                        ctx.pool(),
                        installation_id,
                        ctx.run.id,
                        &payload,
                        &ctx.correlation_id,
                        &ctx.run.actor,
                        &env_id,
                    )
                    .await
                    {
                        tracing::error!(
                            installation_id = %installation_id,
                            error = %mark_err,
                            "Failed to record installation failure"
                        );
                    }
                }
                Err(err)
            }
        }
    }
}

async fn install(
    ctx: &mut RunContext,
    pack_ref: &str,
    env_id: &str,
    claimed: &mut Option<Uuid>,
) -> Result<Value> {
    let run_id = ctx.run.id;

    // 1. Validate the pack manifest; everything later steps need travels
    //    through the step outputs.
    let validated = {
        let pack_ref = pack_ref.to_string();
        ctx.run_step(
            "Validate pack manifest",
            StepKind::ActionTask,
            Some(json!({ "pack_ref": pack_ref, "env_id": env_id })),
            move |scope| async move {
                let pack = packs::get_pack(scope.pool(), &pack_ref).await?.ok_or(
                    XynError::PackNotFound {
                        pack_ref: pack_ref.clone(),
                    },
                )?;

                let manifest = PackManifest::parse(&pack.manifest)?;
                for table in &manifest.tables {
                    validate_identifier(&table.name)?;
                    for column in &table.columns {
                        validate_identifier(&column.name)?;
                        validate_column_type(&column.column_type)?;
                    }
                }

                let schema_name = match pack.schema_name.as_deref() {
                    Some(declared) => {
                        validate_identifier(declared)?;
                        declared.to_string()
                    }
                    None => normalize_schema_name(&pack_ref)?,
                };

                scope
                    .progress(&format!("Validated pack {}", pack_ref), None)
                    .await?;

                Ok(json!({
                    "pack_id": pack.id,
                    "pack_name": pack.name,
                    "version": pack.version,
                    "schema_name": schema_name,
                    "manifest": pack.manifest,
                }))
            },
        )
        .await?
    };

    let pack_id: Uuid = serde_json::from_value(validated["pack_id"].clone())?;
    let version = validated["version"].as_str().unwrap_or_default().to_string();
    let schema_name = validated["schema_name"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let manifest = PackManifest::parse(&validated["manifest"])?;

    // 2. Claim the installation row; a conflict re-reads and classifies.
    let claim_outputs = {
        let pack_ref = pack_ref.to_string();
        let env_id = env_id.to_string();
        let schema_name = schema_name.clone();
        ctx.run_step(
            "Claim installation record",
            StepKind::ActionTask,
            None,
            move |scope| async move {
                let mut conn = scope.pool().acquire().await.map_err(XynError::from)?;
                let claim = ClaimInstallation {
                    pack_id,
                    pack_ref: &pack_ref,
                    env_id: &env_id,
                    schema_mode: "per_pack",
                    schema_name: &schema_name,
                    run_id,
                };
                match packs::claim_installation(&mut *conn, &claim).await? {
                    Some(installation) => Ok(json!({
                        "installation_id": installation.id,
                        "claimed_by_run_id": installation.installed_by_run_id,
                    })),
                    None => {
                        let existing = packs::get_installation(scope.pool(), &pack_ref, &env_id)
                            .await?
                            .ok_or(XynError::Conflict {
                                detail: "installation row vanished during claim".to_string(),
                            })?;
                        Err(packs::conflict_error(&existing))
                    }
                }
            },
        )
        .await?
    };

    let installation_id: Uuid = serde_json::from_value(claim_outputs["installation_id"].clone())?;
    *claimed = Some(installation_id);

    // 3. Provision the schema, its migrations ledger and declared tables.
    {
        let schema_name = schema_name.clone();
        let tables = manifest.tables.clone();
        ctx.run_step(
            "Provision schema",
            StepKind::ActionTask,
            Some(json!({ "schema_name": schema_name, "table_count": tables.len() })),
            move |scope| async move {
                let mut tx = scope.pool().begin().await?;

                sqlx::query(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote_ident(&schema_name)
                ))
                .execute(&mut *tx)
                .await?;

                sqlx::query(&format!(
                    "CREATE TABLE IF NOT EXISTS {}.\"schema_migrations\" \
                     (id TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
                    quote_ident(&schema_name)
                ))
                .execute(&mut *tx)
                .await?;

                let mut tables_created = Vec::with_capacity(tables.len());
                for table in &tables {
                    let create_sql = build_create_table_sql(&schema_name, table)?;
                    sqlx::query(&create_sql).execute(&mut *tx).await?;
                    tables_created.push(table.name.clone());
                }

                tx.commit().await?;

                scope
                    .progress(
                        &format!("Provisioned schema {} ({} tables)", schema_name, tables_created.len()),
                        None,
                    )
                    .await?;

                Ok(json!({
                    "schema_name": schema_name,
                    "tables_created": tables_created,
                }))
            },
        )
        .await?;
    }

    // 4. Apply manifest migrations above the recorded state, one transaction
    //    per migration: DDL, ledger row, installation migration_state.
    let migration_outputs = {
        let schema_name = schema_name.clone();
        let migrations = manifest.migrations.clone();
        let pack_ref = pack_ref.to_string();
        let env_id = env_id.to_string();
        ctx.run_step(
            "Apply migrations",
            StepKind::ActionTask,
            Some(json!({ "migration_count": migrations.len() })),
            move |scope| async move {
                let installation = packs::get_installation(scope.pool(), &pack_ref, &env_id)
                    .await?
                    .ok_or(XynError::NotFound {
                        entity: "pack_installation",
                        id: installation_id.to_string(),
                    })?;

                let start = installation
                    .migration_state
                    .as_deref()
                    .and_then(|current| migrations.iter().position(|m| m.id == current))
                    .map(|position| position + 1)
                    .unwrap_or(0);

                let mut applied = Vec::new();
                for migration in &migrations[start..] {
                    let total = migrations.len();
                    scope
                        .progress(
                            &format!("Applying migration {} ({}/{})", migration.id, start + applied.len() + 1, total),
                            None,
                        )
                        .await?;

                    let mut tx = scope.pool().begin().await?;
                    if let Some(sql) = migration.sql.as_deref().filter(|s| !s.trim().is_empty()) {
                        sqlx::query(sql).execute(&mut *tx).await.map_err(|e| {
                            XynError::MigrationApplyFailed {
                                migration_id: migration.id.clone(),
                                detail: e.to_string(),
                            }
                        })?;
                    }
                    sqlx::query(&format!(
                        "INSERT INTO {}.\"schema_migrations\" (id) VALUES ($1) \
                         ON CONFLICT (id) DO NOTHING",
                        quote_ident(&schema_name)
                    ))
                    .bind(&migration.id)
                    .execute(&mut *tx)
                    .await?;
                    packs::set_migration_state(&mut tx, installation_id, &migration.id).await?;
                    tx.commit().await?;

                    applied.push(migration.id.clone());
                }

                Ok(json!({
                    "migrations_applied": applied,
                    "migration_count": applied.len(),
                }))
            },
        )
        .await?
    };

    let migration_state = migration_outputs["migrations_applied"]
        .as_array()
        .and_then(|applied| applied.last())
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "init".to_string());

    // 5. Finalize inside the short row-locked critical section.
    let finalize_outputs = {
        let version = version.clone();
        let migration_state = migration_state.clone();
        let correlation_id = ctx.correlation_id.clone();
        let actor = ctx.run.actor.clone();
        let env_id = env_id.to_string();
        ctx.run_step(
            "Finalize installation",
            StepKind::ActionTask,
            None,
            move |scope| async move {
                scope
                    .progress("Locking installation record for finalization", None)
                    .await?;

                let finalize = FinalizeInstallation {
                    installation_id,
                    run_id,
                    version: &version,
                    migration_state: &migration_state,
                    correlation_id: &correlation_id,
                    actor: &actor,
                    env_id: &env_id,
                };
                let updated = packs::finalize_installation(scope.pool(), &finalize).await?;

                Ok(json!({
                    "status": updated.status,
                    "installed_version": updated.installed_version,
                    "migration_state": updated.migration_state,
                    "schema_name": updated.schema_name,
                    "installed_by_run_id": updated.installed_by_run_id,
                }))
            },
        )
        .await?
    };

    Ok(json!({
        "pack_id": pack_id,
        "installation_id": installation_id,
        "schema_name": schema_name,
        "version": version,
        "migration_state": finalize_outputs["migration_state"],
    }))
}
