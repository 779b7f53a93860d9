// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed artifact storage on the local filesystem.
//!
//! Blobs live under a two-level tree keyed by their content hash:
//! `<base>/<sha256[..2]>/<sha256[2..4]>/<sha256>`. Identical content
//! dedupes naturally. The database row records hash, length and the
//! relative storage path.

use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Result, XynError};
use crate::model::ArtifactRecord;
use crate::store::artifacts::{self, NewArtifact};

/// A stored blob: hash, length and path relative to the store base.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Hex-encoded content hash.
    pub sha256: String,
    /// Content length in bytes.
    pub byte_length: i64,
    /// Path relative to the store base directory.
    pub relative_path: String,
}

/// Local filesystem artifact store.
#[derive(Debug, Clone)]
pub struct LocalFsArtifactStore {
    base: PathBuf,
}

impl LocalFsArtifactStore {
    /// Store rooted at the given base directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn blob_path(&self, sha256: &str) -> PathBuf {
        self.base
            .join(&sha256[..2])
            .join(&sha256[2..4])
            .join(sha256)
    }

    /// Write content into the tree, returning its hash, length and path.
    pub async fn put(&self, content: &[u8]) -> Result<StoredBlob> {
        let sha256 = hex::encode(Sha256::digest(content));
        let path = self.blob_path(&sha256);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        // Content-addressed: an existing blob with this hash is identical.
        if tokio::fs::try_exists(&path).await.map_err(io_error)? {
            return Ok(self.blob(sha256, content.len() as i64));
        }
        tokio::fs::write(&path, content).await.map_err(io_error)?;

        Ok(self.blob(sha256, content.len() as i64))
    }

    fn blob(&self, sha256: String, byte_length: i64) -> StoredBlob {
        let relative_path = format!("{}/{}/{}", &sha256[..2], &sha256[2..4], sha256);
        StoredBlob {
            sha256,
            byte_length,
            relative_path,
        }
    }

    /// Read a blob by hash; `None` when absent.
    pub async fn read(&self, sha256: &str) -> Result<Option<Vec<u8>>> {
        if sha256.len() < 4 {
            return Err(XynError::Validation {
                field: "sha256".to_string(),
                message: "hash too short".to_string(),
            });
        }
        let path = self.blob_path(sha256);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err)),
        }
    }
}

fn io_error(err: std::io::Error) -> XynError {
    XynError::Validation {
        field: "artifact_store".to_string(),
        message: err.to_string(),
    }
}

/// Buffers log lines for one step and finalizes them into an artifact.
///
/// The blob, the artifact row and the step back-reference are written at
/// finalize time, so a crashed step never leaves a dangling artifact row.
pub struct StepLogCapture {
    step_id: Uuid,
    run_id: Uuid,
    correlation_id: String,
    env_id: String,
    lines: Vec<String>,
}

impl StepLogCapture {
    /// Capture for one step.
    pub fn new(step_id: Uuid, run_id: Uuid, correlation_id: &str, env_id: &str) -> Self {
        Self {
            step_id,
            run_id,
            correlation_id: correlation_id.to_string(),
            env_id: env_id.to_string(),
            lines: Vec::new(),
        }
    }

    /// Append one log line.
    pub fn write(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Store the buffered lines as an artifact and link it to the step.
    pub async fn finalize(
        self,
        pool: &PgPool,
        store: &LocalFsArtifactStore,
    ) -> Result<ArtifactRecord> {
        let content = self.lines.join("\n").into_bytes();
        let blob = store.put(&content).await?;

        let mut conn = pool.acquire().await.map_err(XynError::from)?;
        let record = artifacts::insert(
            &mut *conn,
            &NewArtifact {
                name: format!("step-{}-logs.txt", self.step_id),
                kind: "log".to_string(),
                content_type: "text/plain".to_string(),
                byte_length: Some(blob.byte_length),
                sha256: Some(blob.sha256.clone()),
                run_id: Some(self.run_id),
                step_id: Some(self.step_id),
                created_by: "system".to_string(),
                metadata: json!({ "line_count": self.lines.len() }),
                storage_path: Some(blob.relative_path.clone()),
            },
            Some(&self.correlation_id),
            &self.env_id,
        )
        .await?;
        drop(conn);

        crate::store::steps::set_logs_artifact(pool, self.step_id, record.id).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("xyn-artifacts-{}", Uuid::new_v4()));
        let store = LocalFsArtifactStore::new(&dir);

        let blob = store.put(b"hello artifacts").await.unwrap();
        assert_eq!(blob.byte_length, 15);
        assert_eq!(blob.sha256.len(), 64);
        assert_eq!(
            blob.relative_path,
            format!("{}/{}/{}", &blob.sha256[..2], &blob.sha256[2..4], blob.sha256)
        );

        let content = store.read(&blob.sha256).await.unwrap().unwrap();
        assert_eq!(content, b"hello artifacts");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_put_dedupes_identical_content() {
        let dir = std::env::temp_dir().join(format!("xyn-artifacts-{}", Uuid::new_v4()));
        let store = LocalFsArtifactStore::new(&dir);

        let first = store.put(b"same bytes").await.unwrap();
        let second = store.put(b"same bytes").await.unwrap();
        assert_eq!(first.sha256, second.sha256);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_read_missing_blob() {
        let dir = std::env::temp_dir().join(format!("xyn-artifacts-{}", Uuid::new_v4()));
        let store = LocalFsArtifactStore::new(&dir);
        let absent = store
            .read("0000000000000000000000000000000000000000000000000000000000000000")
            .await
            .unwrap();
        assert!(absent.is_none());
    }
}
