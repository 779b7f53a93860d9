// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pack catalog, installation rows and schema-name safety.
//!
//! Every identifier that reaches DDL is validated against a fixed character
//! class and quoted. The installation state machine's database half lives
//! here: claim-insert, row lock, finalize and failure recording.

use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{Result, XynError};
use crate::model::{InstallStatus, PackInstallationRecord, PackRecord};
use crate::store::events::{self, names, NewEvent};
use crate::store::required;

const PACK_COLUMNS: &str = "id, pack_ref, name, version, pack_type, schema_name, manifest, \
     dependencies, created_at, updated_at";

const INSTALLATION_COLUMNS: &str = "id, pack_id, pack_ref, env_id, status, schema_mode, \
     schema_name, migration_provider, installed_version, migration_state, installed_at, \
     installed_by_run_id, updated_by_run_id, error, last_error_at, created_at, updated_at";

// ============================================================================
// Manifest
// ============================================================================

/// Parsed pack manifest: declared tables and ordered migrations.
#[derive(Debug, Clone, Deserialize)]
pub struct PackManifest {
    /// Tables provisioned during installation.
    #[serde(default)]
    pub tables: Vec<TableDef>,
    /// Ordered migrations; applied above the recorded `migration_state`.
    #[serde(default)]
    pub migrations: Vec<MigrationDef>,
}

/// A declared table.
#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    /// Table name; validated as an identifier.
    pub name: String,
    /// Declared columns.
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

/// A declared column.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    /// Column name; validated as an identifier.
    pub name: String,
    /// Column type; validated against the allowed type set.
    #[serde(rename = "type")]
    pub column_type: String,
    /// Whether the column is the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Nullability; `Some(false)` adds NOT NULL.
    #[serde(default)]
    pub nullable: Option<bool>,
    /// Whether the column carries a UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
    /// Same-schema foreign key as `table.column`.
    #[serde(default)]
    pub foreign_key: Option<String>,
}

/// A declared migration with a stable id and DDL.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationDef {
    /// Stable migration id, unique within the manifest.
    pub id: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// DDL to execute; empty migrations only advance the ledger.
    #[serde(default)]
    pub sql: Option<String>,
}

impl PackManifest {
    /// Parse a manifest from its JSONB column value.
    pub fn parse(manifest: &Value) -> Result<Self> {
        serde_json::from_value(manifest.clone()).map_err(|e| XynError::Validation {
            field: "manifest".to_string(),
            message: e.to_string(),
        })
    }
}

// ============================================================================
// Identifier safety
// ============================================================================

/// Column types permitted in pack table definitions.
const ALLOWED_COLUMN_TYPES: &[&str] = &[
    "TEXT",
    "INTEGER",
    "BIGINT",
    "UUID",
    "TIMESTAMPTZ",
    "JSONB",
    "BOOLEAN",
    "DOUBLE PRECISION",
    "NUMERIC",
    "DATE",
];

/// Validate an identifier against `^[a-z_][a-z0-9_]{0,62}$`.
pub fn validate_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ident.is_empty() || ident.len() > 63 || !valid_first || !valid_rest {
        return Err(XynError::InvalidIdentifier {
            identifier: ident.to_string(),
        });
    }
    Ok(())
}

/// Derive the per-pack schema name from a pack reference.
///
/// `core.domain@v1` becomes `pack_core_domain`: the version suffix is
/// dropped, separators map to underscores, the result is validated.
pub fn normalize_schema_name(pack_ref: &str) -> Result<String> {
    let base = pack_ref.split('@').next().unwrap_or(pack_ref);
    let mapped: String = base
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let name = format!("pack_{}", mapped);
    validate_identifier(&name)?;
    Ok(name)
}

/// Quote a previously validated identifier for DDL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Validate a declared column type against the allowed set.
pub fn validate_column_type(column_type: &str) -> Result<()> {
    let upper = column_type.trim().to_ascii_uppercase();
    if ALLOWED_COLUMN_TYPES.contains(&upper.as_str()) {
        Ok(())
    } else {
        Err(XynError::InvalidIdentifier {
            identifier: column_type.to_string(),
        })
    }
}

/// Build the idempotent CREATE TABLE statement for a declared table.
///
/// Pure so it is testable without a database; all identifiers are validated
/// and quoted, types come from the allowlist.
pub fn build_create_table_sql(schema: &str, table: &TableDef) -> Result<String> {
    validate_identifier(schema)?;
    validate_identifier(&table.name)?;

    let mut clauses: Vec<String> = Vec::new();
    for column in &table.columns {
        validate_identifier(&column.name)?;
        validate_column_type(&column.column_type)?;
        let mut clause = format!(
            "{} {}",
            quote_ident(&column.name),
            column.column_type.trim().to_ascii_uppercase()
        );
        if column.primary_key {
            clause.push_str(" PRIMARY KEY");
        }
        if column.nullable == Some(false) {
            clause.push_str(" NOT NULL");
        }
        if column.unique {
            clause.push_str(" UNIQUE");
        }
        clauses.push(clause);
    }
    for column in &table.columns {
        if let Some(fk) = &column.foreign_key {
            let (fk_table, fk_column) = fk.split_once('.').ok_or(XynError::InvalidIdentifier {
                identifier: fk.clone(),
            })?;
            validate_identifier(fk_table)?;
            validate_identifier(fk_column)?;
            clauses.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}.{}({})",
                quote_ident(&column.name),
                quote_ident(schema),
                quote_ident(fk_table),
                quote_ident(fk_column)
            ));
        }
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_ident(schema),
        quote_ident(&table.name),
        clauses.join(", ")
    ))
}

// ============================================================================
// Pack catalog
// ============================================================================

/// A new pack catalog entry.
#[derive(Debug, Clone)]
pub struct NewPack {
    /// Pack reference, e.g. `core.domain@v1`.
    pub pack_ref: String,
    /// Display name.
    pub name: String,
    /// Pack version, e.g. `1.0.0`.
    pub version: String,
    /// Pack type discriminator.
    pub pack_type: String,
    /// Declared schema name; derived from the ref when absent.
    pub schema_name: Option<String>,
    /// Manifest document.
    pub manifest: Value,
    /// Declared dependencies.
    pub dependencies: Value,
}

/// Insert or refresh a pack catalog entry (used by seeding and tests).
pub async fn upsert_pack(pool: &PgPool, new: &NewPack) -> Result<PackRecord> {
    let sql = format!(
        r#"
        INSERT INTO packs (id, pack_ref, name, version, pack_type, schema_name, manifest, dependencies)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (pack_ref) DO UPDATE
        SET name = EXCLUDED.name,
            version = EXCLUDED.version,
            pack_type = EXCLUDED.pack_type,
            schema_name = EXCLUDED.schema_name,
            manifest = EXCLUDED.manifest,
            dependencies = EXCLUDED.dependencies,
            updated_at = NOW()
        RETURNING {}
        "#,
        PACK_COLUMNS
    );

    let record = sqlx::query_as::<_, PackRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(&new.pack_ref)
        .bind(&new.name)
        .bind(&new.version)
        .bind(&new.pack_type)
        .bind(&new.schema_name)
        .bind(&new.manifest)
        .bind(&new.dependencies)
        .fetch_one(pool)
        .await?;

    Ok(record)
}

/// Get a pack by reference.
pub async fn get_pack(pool: &PgPool, pack_ref: &str) -> Result<Option<PackRecord>> {
    let sql = format!("SELECT {} FROM packs WHERE pack_ref = $1", PACK_COLUMNS);
    let record = sqlx::query_as::<_, PackRecord>(&sql)
        .bind(pack_ref)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// List packs newest-first with an id cursor.
pub async fn list_packs(pool: &PgPool, cursor: Option<Uuid>, limit: i64) -> Result<Vec<PackRecord>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM packs
        WHERE ($1::UUID IS NULL
               OR NOT EXISTS (SELECT 1 FROM packs c WHERE c.id = $1)
               OR (created_at, id) < (SELECT c.created_at, c.id FROM packs c WHERE c.id = $1))
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
        PACK_COLUMNS
    );
    let records = sqlx::query_as::<_, PackRecord>(&sql)
        .bind(cursor)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

// ============================================================================
// Installation state machine (database half)
// ============================================================================

/// Parameters for the idempotent claim insert.
#[derive(Debug, Clone)]
pub struct ClaimInstallation<'a> {
    /// Pack being installed.
    pub pack_id: Uuid,
    /// Pack reference.
    pub pack_ref: &'a str,
    /// Environment id.
    pub env_id: &'a str,
    /// Schema isolation mode.
    pub schema_mode: &'a str,
    /// Target schema name.
    pub schema_name: &'a str,
    /// The claiming run; recorded as `installed_by_run_id` at claim time.
    pub run_id: Uuid,
}

/// Atomically claim the installation row for `(pack_ref, env_id)`.
///
/// Returns `None` when the unique constraint already holds a row; the caller
/// re-reads and classifies via [`conflict_error`].
pub async fn claim_installation(
    conn: &mut PgConnection,
    claim: &ClaimInstallation<'_>,
) -> Result<Option<PackInstallationRecord>> {
    let sql = format!(
        r#"
        INSERT INTO pack_installations
            (id, pack_id, pack_ref, env_id, status, schema_mode, schema_name,
             migration_provider, installed_by_run_id)
        VALUES ($1, $2, $3, $4, 'installing', $5, $6, 'sql', $7)
        ON CONFLICT ON CONSTRAINT uq_pack_installations_env_pack DO NOTHING
        RETURNING {}
        "#,
        INSTALLATION_COLUMNS
    );

    let record = sqlx::query_as::<_, PackInstallationRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(claim.pack_id)
        .bind(claim.pack_ref)
        .bind(claim.env_id)
        .bind(claim.schema_mode)
        .bind(claim.schema_name)
        .bind(claim.run_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(record)
}

/// Classify an existing installation row into the typed conflict error.
pub fn conflict_error(existing: &PackInstallationRecord) -> XynError {
    match existing.install_status() {
        Some(InstallStatus::Installed) => XynError::PackAlreadyInstalled {
            pack_ref: existing.pack_ref.clone(),
            env_id: existing.env_id.clone(),
            installation_id: existing.id,
            installed_by_run_id: existing.installed_by_run_id,
        },
        Some(InstallStatus::Installing) => XynError::InstallationInProgress {
            pack_ref: existing.pack_ref.clone(),
            env_id: existing.env_id.clone(),
            installation_id: existing.id,
            installing_run_id: existing.installed_by_run_id,
        },
        Some(InstallStatus::Failed) => XynError::InstallationPreviouslyFailed {
            pack_ref: existing.pack_ref.clone(),
            env_id: existing.env_id.clone(),
            installation_id: existing.id,
            error_details: existing.error.clone(),
            last_error_at: existing.last_error_at,
        },
        _ => XynError::ConflictingState {
            pack_ref: existing.pack_ref.clone(),
            env_id: existing.env_id.clone(),
            installation_id: existing.id,
            status: existing.status.clone(),
        },
    }
}

/// Get the installation row for `(pack_ref, env_id)`.
pub async fn get_installation(
    pool: &PgPool,
    pack_ref: &str,
    env_id: &str,
) -> Result<Option<PackInstallationRecord>> {
    let sql = format!(
        "SELECT {} FROM pack_installations WHERE pack_ref = $1 AND env_id = $2",
        INSTALLATION_COLUMNS
    );
    let record = sqlx::query_as::<_, PackInstallationRecord>(&sql)
        .bind(pack_ref)
        .bind(env_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Lock the installation row for the finalize critical section.
async fn lock_installation(
    conn: &mut PgConnection,
    installation_id: Uuid,
) -> Result<PackInstallationRecord> {
    let sql = format!(
        "SELECT {} FROM pack_installations WHERE id = $1 FOR UPDATE",
        INSTALLATION_COLUMNS
    );
    let record = sqlx::query_as::<_, PackInstallationRecord>(&sql)
        .bind(installation_id)
        .fetch_optional(&mut *conn)
        .await?;
    required(record, "pack_installation", installation_id.to_string())
}

/// Advance the recorded migration state after a migration applied.
pub async fn set_migration_state(
    conn: &mut PgConnection,
    installation_id: Uuid,
    migration_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pack_installations
        SET migration_state = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(installation_id)
    .bind(migration_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Parameters for the finalize critical section.
#[derive(Debug, Clone)]
pub struct FinalizeInstallation<'a> {
    /// The installation row to finalize.
    pub installation_id: Uuid,
    /// The run performing the finalize; must own the row.
    pub run_id: Uuid,
    /// Version recorded as installed.
    pub version: &'a str,
    /// Latest migration id applied, or `init` when the manifest has none.
    pub migration_state: &'a str,
    /// Correlation id for the completion event.
    pub correlation_id: &'a str,
    /// Actor for the completion event.
    pub actor: &'a str,
    /// Environment id for the completion event.
    pub env_id: &'a str,
}

/// Finalize an installation: short row-locked transaction that verifies
/// ownership, enforces the installed invariants and flips the status.
///
/// Idempotent: a row that is already `installed` is returned untouched. The
/// database check constraint is the second line of defense; its violation
/// aborts the transaction and surfaces as `invariant_violation`.
pub async fn finalize_installation(
    pool: &PgPool,
    finalize: &FinalizeInstallation<'_>,
) -> Result<PackInstallationRecord> {
    let mut tx = pool.begin().await?;
    let locked = lock_installation(&mut tx, finalize.installation_id).await?;

    match locked.install_status() {
        Some(InstallStatus::Installed) => {
            // Another attempt by this run already finished; nothing to write.
            tx.commit().await?;
            return Ok(locked);
        }
        Some(InstallStatus::Installing) => {}
        _ => {
            return Err(XynError::ConflictingState {
                pack_ref: locked.pack_ref.clone(),
                env_id: locked.env_id.clone(),
                installation_id: locked.id,
                status: locked.status.clone(),
            });
        }
    }

    if locked.installed_by_run_id != Some(finalize.run_id) {
        return Err(XynError::OwnershipViolation {
            installation_id: locked.id,
            expected_run_id: finalize.run_id,
            actual_run_id: locked.installed_by_run_id,
        });
    }

    if locked.schema_name.is_none() {
        return Err(XynError::InvariantViolation {
            detail: "schema_name must be set before marking as installed".to_string(),
        });
    }
    if finalize.version.is_empty() {
        return Err(XynError::InvariantViolation {
            detail: "pack version must be set before marking as installed".to_string(),
        });
    }

    let sql = format!(
        r#"
        UPDATE pack_installations
        SET status = 'installed',
            installed_version = $2,
            migration_state = $3,
            installed_at = NOW(),
            error = NULL,
            updated_by_run_id = $4,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        INSTALLATION_COLUMNS
    );

    let updated = sqlx::query_as::<_, PackInstallationRecord>(&sql)
        .bind(locked.id)
        .bind(finalize.version)
        .bind(finalize.migration_state)
        .bind(finalize.run_id)
        .fetch_one(&mut *tx)
        .await?;

    let mut event = NewEvent::new(names::PACK_INSTALL_COMPLETED, finalize.correlation_id);
    event.env_id = finalize.env_id.to_string();
    event.actor = finalize.actor.to_string();
    event.run_id = Some(finalize.run_id);
    event.resource_type = Some("pack_installation".to_string());
    event.resource_id = Some(updated.id.to_string());
    event.data = json!({
        "pack_ref": updated.pack_ref,
        "env_id": updated.env_id,
        "installed_version": updated.installed_version,
        "schema_name": updated.schema_name,
        "migration_state": updated.migration_state,
    });
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;
    Ok(updated)
}

/// Record a failed installation attempt: the row stays for inspection with
/// the error payload and `last_error_at` set.
pub async fn mark_installation_failed(
    pool: &PgPool,
    installation_id: Uuid,
    run_id: Uuid,
    error_payload: &Value,
    correlation_id: &str,
    actor: &str,
    env_id: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let locked = lock_installation(&mut tx, installation_id).await?;

    // A concurrently finalized row wins over the failure write.
    if locked.install_status() == Some(InstallStatus::Installed) {
        tx.commit().await?;
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE pack_installations
        SET status = 'failed',
            error = $2,
            last_error_at = NOW(),
            updated_by_run_id = $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(locked.id)
    .bind(error_payload)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;

    let mut event = NewEvent::new(names::PACK_INSTALL_FAILED, correlation_id);
    event.env_id = env_id.to_string();
    event.actor = actor.to_string();
    event.run_id = Some(run_id);
    event.resource_type = Some("pack_installation".to_string());
    event.resource_id = Some(locked.id.to_string());
    event.data = json!({
        "pack_ref": locked.pack_ref,
        "env_id": locked.env_id,
        "error": error_payload,
    });
    events::emit(&mut *tx, event).await?;

    tx.commit().await?;
    Ok(())
}
