// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact rows. Content lives in the filesystem store; the row records the
//! hash, length and storage path. Rows are immutable after creation.

use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::model::ArtifactRecord;
use crate::store::events::{self, names, NewEvent};

const ARTIFACT_COLUMNS: &str = "id, name, kind, content_type, byte_length, sha256, run_id, \
     step_id, created_by, metadata, storage_path, created_at";

/// A new artifact row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Artifact name.
    pub name: String,
    /// Artifact kind (log, report, bundle, file).
    pub kind: String,
    /// MIME content type.
    pub content_type: String,
    /// Content length in bytes.
    pub byte_length: Option<i64>,
    /// Content hash when content is stored.
    pub sha256: Option<String>,
    /// Owning run.
    pub run_id: Option<Uuid>,
    /// Owning step.
    pub step_id: Option<Uuid>,
    /// Creator.
    pub created_by: String,
    /// Opaque metadata.
    pub metadata: Value,
    /// Relative path inside the artifact store.
    pub storage_path: Option<String>,
}

/// Insert an artifact row and emit `xyn.artifact.attached` in the same
/// transaction when a correlation id is available.
pub async fn insert(
    conn: &mut PgConnection,
    new: &NewArtifact,
    correlation_id: Option<&str>,
    env_id: &str,
) -> Result<ArtifactRecord> {
    let sql = format!(
        r#"
        INSERT INTO artifacts
            (id, name, kind, content_type, byte_length, sha256, run_id, step_id,
             created_by, metadata, storage_path)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {}
        "#,
        ARTIFACT_COLUMNS
    );

    let record = sqlx::query_as::<_, ArtifactRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.kind)
        .bind(&new.content_type)
        .bind(new.byte_length)
        .bind(&new.sha256)
        .bind(new.run_id)
        .bind(new.step_id)
        .bind(&new.created_by)
        .bind(&new.metadata)
        .bind(&new.storage_path)
        .fetch_one(&mut *conn)
        .await?;

    if let Some(correlation_id) = correlation_id {
        let mut event = NewEvent::new(names::ARTIFACT_ATTACHED, correlation_id);
        event.env_id = env_id.to_string();
        event.actor = record.created_by.clone();
        event.run_id = record.run_id;
        event.step_id = record.step_id;
        event.resource_type = Some("artifact".to_string());
        event.resource_id = Some(record.id.to_string());
        event.data = json!({
            "name": record.name,
            "kind": record.kind,
            "sha256": record.sha256,
            "byte_length": record.byte_length,
        });
        events::emit(&mut *conn, event).await?;
    }

    Ok(record)
}

/// Get an artifact by id.
pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<ArtifactRecord>> {
    let sql = format!("SELECT {} FROM artifacts WHERE id = $1", ARTIFACT_COLUMNS);
    let record = sqlx::query_as::<_, ArtifactRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}
