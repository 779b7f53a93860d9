// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record types and status enums for the runtime tables.
//!
//! Records mirror table rows one-to-one and carry their status as the raw
//! TEXT column; the enums decode/encode at the edges that care.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Run execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Waiting in the queue, eligible when `run_at <= now`.
    Queued,
    /// Claimed and leased by exactly one worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl RunStatus {
    /// Status string as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// All statuses, in queue-lifecycle order.
    pub const ALL: [RunStatus; 5] = [
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Inserted, not yet started.
    Created,
    /// Handler is executing.
    Running,
    /// Handler finished successfully.
    Completed,
    /// Handler failed.
    Failed,
    /// Skipped without execution.
    Skipped,
}

impl StepStatus {
    /// Status string as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Step kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// A deterministic action (DDL, IO, state transition).
    ActionTask,
    /// A delegated task executed by an agent.
    AgentTask,
    /// A manual-wait gate (not executable in v0 plans).
    Gate,
    /// A pure data transformation.
    Transform,
}

impl StepKind {
    /// Kind string as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActionTask => "action_task",
            Self::AgentTask => "agent_task",
            Self::Gate => "gate",
            Self::Transform => "transform",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action_task" => Ok(Self::ActionTask),
            "agent_task" => Ok(Self::AgentTask),
            "gate" => Ok(Self::Gate),
            "transform" => Ok(Self::Transform),
            other => Err(format!("unknown step kind '{}'", other)),
        }
    }
}

/// Pack installation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Catalog entry exists, nothing installed.
    Available,
    /// A run holds the installation claim.
    Installing,
    /// Fully installed.
    Installed,
    /// An upgrade run holds the row.
    Upgrading,
    /// The last attempt failed; row kept for inspection.
    Failed,
    /// An uninstall run holds the row.
    Uninstalling,
}

impl InstallStatus {
    /// Status string as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Upgrading => "upgrading",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
        }
    }
}

impl FromStr for InstallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "installing" => Ok(Self::Installing),
            "installed" => Ok(Self::Installed),
            "upgrading" => Ok(Self::Upgrading),
            "failed" => Ok(Self::Failed),
            "uninstalling" => Ok(Self::Uninstalling),
            other => Err(format!("unknown installation status '{}'", other)),
        }
    }
}

/// Run row from the queue table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    /// Stable run id.
    pub id: Uuid,
    /// Human name; doubles as the blueprint reference when none is set.
    pub name: String,
    /// Optional blueprint reference.
    pub blueprint_ref: Option<String>,
    /// Current status (queued, running, completed, failed, cancelled).
    pub status: String,
    /// Actor that created the run.
    pub actor: String,
    /// Correlation id propagated across events and logs.
    pub correlation_id: String,
    /// Opaque input payload.
    pub inputs: Value,
    /// Output payload on success.
    pub outputs: Option<Value>,
    /// Error payload on failure.
    pub error: Option<Value>,
    /// Claim priority; lower claims earlier.
    pub priority: i32,
    /// Claim counter; incremented on every claim including reclaims.
    pub attempt: i32,
    /// Retry ceiling; NULL means unlimited.
    pub max_attempts: Option<i32>,
    /// Earliest time the run is eligible to claim.
    pub run_at: DateTime<Utc>,
    /// When the run entered the queue.
    pub queued_at: DateTime<Utc>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// First claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last claim time.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    pub locked_by: Option<String>,
    /// Lease expiry; reclaim becomes possible after this.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag, observed at step boundaries.
    pub cancel_requested: bool,
    /// Parent run for spawned children.
    pub parent_run_id: Option<Uuid>,
}

impl RunRecord {
    /// Decode the status column.
    pub fn run_status(&self) -> Option<RunStatus> {
        self.status.parse().ok()
    }
}

/// Edge between a parent run and a spawned child.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunEdgeRecord {
    /// Edge id.
    pub id: Uuid,
    /// Parent run.
    pub parent_run_id: Uuid,
    /// Child run.
    pub child_run_id: Uuid,
    /// Relation label.
    pub relation: String,
    /// Idempotency key; unique per parent when set.
    pub child_key: Option<String>,
    /// When the edge was created.
    pub created_at: DateTime<Utc>,
}

/// Step row; strictly ordered by `idx` within its run.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StepRecord {
    /// Step id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Step name.
    pub name: String,
    /// 0-based position within the run.
    pub idx: i32,
    /// Step kind discriminator.
    pub kind: String,
    /// Current status.
    pub status: String,
    /// Resolved inputs.
    pub inputs: Option<Value>,
    /// Outputs on success.
    pub outputs: Option<Value>,
    /// Error payload on failure.
    pub error: Option<Value>,
    /// Captured log artifact, when any.
    pub logs_artifact_id: Option<Uuid>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the handler started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only event row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    /// Event id.
    pub id: Uuid,
    /// Dotted lowercase event name (e.g. `xyn.run.started`).
    pub event_name: String,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
    /// Environment the event belongs to.
    pub env_id: String,
    /// Actor that caused the event.
    pub actor: String,
    /// Correlation id; matches the emitting run's.
    pub correlation_id: String,
    /// Emitting run, when any.
    pub run_id: Option<Uuid>,
    /// Emitting step, when any.
    pub step_id: Option<Uuid>,
    /// Referenced resource type.
    pub resource_type: Option<String>,
    /// Referenced resource id.
    pub resource_id: Option<String>,
    /// Free-form payload.
    pub data: Value,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Artifact row; immutable after creation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ArtifactRecord {
    /// Artifact id.
    pub id: Uuid,
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
    /// Owning run, when any.
    pub run_id: Option<Uuid>,
    /// Owning step, when any.
    pub step_id: Option<Uuid>,
    /// Creator.
    pub created_by: String,
    /// Opaque metadata.
    pub metadata: Value,
    /// Relative path inside the artifact store.
    pub storage_path: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Pack catalog row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PackRecord {
    /// Pack id.
    pub id: Uuid,
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
    /// Manifest: declared tables and ordered migrations.
    pub manifest: Value,
    /// Declared dependencies.
    pub dependencies: Value,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Per-environment pack installation row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PackInstallationRecord {
    /// Installation id.
    pub id: Uuid,
    /// Installed pack.
    pub pack_id: Uuid,
    /// Pack reference.
    pub pack_ref: String,
    /// Environment id.
    pub env_id: String,
    /// Installation status.
    pub status: String,
    /// Schema isolation mode.
    pub schema_mode: String,
    /// Provisioned schema name.
    pub schema_name: Option<String>,
    /// Migration tooling discriminator.
    pub migration_provider: String,
    /// Installed pack version.
    pub installed_version: Option<String>,
    /// Latest applied migration id.
    pub migration_state: Option<String>,
    /// When the install was finalized.
    pub installed_at: Option<DateTime<Utc>>,
    /// The run that claimed and finalized the install.
    pub installed_by_run_id: Option<Uuid>,
    /// The run that last mutated the row.
    pub updated_by_run_id: Option<Uuid>,
    /// Error payload from the last failed attempt.
    pub error: Option<Value>,
    /// When the last failure was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl PackInstallationRecord {
    /// Decode the status column.
    pub fn install_status(&self) -> Option<InstallStatus> {
        self.status.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("pending".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_step_kind_round_trip() {
        for kind in ["action_task", "agent_task", "gate", "transform"] {
            assert_eq!(kind.parse::<StepKind>().unwrap().as_str(), kind);
        }
    }
}
