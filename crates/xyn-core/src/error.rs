// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for xyn-core.
//!
//! Every variant maps to a stable snake_case kind string via [`XynError::kind`].
//! The kind strings are the taxonomy the HTTP API and logs expose; they are
//! also written into `runs.error` / `steps.error` payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

/// Result type using XynError.
pub type Result<T> = std::result::Result<T, XynError>;

/// Core errors for queue, executor, pack installation and store operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum XynError {
    /// The worker no longer owns the run's lease.
    LostLease {
        /// The run whose lease was lost.
        run_id: Uuid,
    },

    /// The run exceeded its wall-clock deadline.
    RunDeadlineExceeded {
        /// The run that timed out.
        run_id: Uuid,
        /// The configured limit in seconds.
        limit_seconds: u64,
    },

    /// The run created more steps than its budget allows.
    StepBudgetExceeded {
        /// The run that exceeded its budget.
        run_id: Uuid,
        /// The configured step budget.
        budget: u32,
    },

    /// Cancellation was requested and observed at a step boundary.
    RunCancelled {
        /// The cancelled run.
        run_id: Uuid,
    },

    /// A step handler panicked; the panic was caught at the executor boundary.
    HandlerCrash {
        /// Panic payload rendered as text.
        detail: String,
    },

    /// A step handler returned an error; the run-level view of a step failure.
    StepHandlerError {
        /// Name of the failing step.
        step_name: String,
        /// The underlying step error.
        source: Box<XynError>,
    },

    /// A template expression could not be resolved against the run scope.
    TemplateResolution {
        /// The offending expression.
        expression: String,
        /// Why resolution failed.
        detail: String,
    },

    /// No blueprint is registered under the requested reference.
    BlueprintNotFound {
        /// The unresolved blueprint reference.
        blueprint_ref: String,
    },

    /// The pack reference does not exist in the catalog.
    PackNotFound {
        /// The unresolved pack reference.
        pack_ref: String,
    },

    /// The pack is already installed in this environment.
    PackAlreadyInstalled {
        /// Pack reference.
        pack_ref: String,
        /// Environment id.
        env_id: String,
        /// The existing installation row.
        installation_id: Uuid,
        /// The run that installed it, when recorded.
        installed_by_run_id: Option<Uuid>,
    },

    /// Another run is currently installing the pack.
    InstallationInProgress {
        /// Pack reference.
        pack_ref: String,
        /// Environment id.
        env_id: String,
        /// The existing installation row.
        installation_id: Uuid,
        /// The run holding the installation claim.
        installing_run_id: Option<Uuid>,
    },

    /// A previous installation attempt failed and was left for inspection.
    InstallationPreviouslyFailed {
        /// Pack reference.
        pack_ref: String,
        /// Environment id.
        env_id: String,
        /// The existing installation row.
        installation_id: Uuid,
        /// The recorded error payload.
        error_details: Option<Value>,
        /// When the failure was recorded.
        last_error_at: Option<DateTime<Utc>>,
    },

    /// The installation row is in a state that excludes a fresh install.
    ConflictingState {
        /// Pack reference.
        pack_ref: String,
        /// Environment id.
        env_id: String,
        /// The existing installation row.
        installation_id: Uuid,
        /// The conflicting status.
        status: String,
    },

    /// A finalize was attempted by a run that does not own the installation.
    OwnershipViolation {
        /// The installation row.
        installation_id: Uuid,
        /// The run performing the finalize.
        expected_run_id: Uuid,
        /// The run recorded as owner.
        actual_run_id: Option<Uuid>,
    },

    /// A database-enforced invariant was violated.
    InvariantViolation {
        /// What was violated.
        detail: String,
    },

    /// An identifier derived from user input failed validation.
    InvalidIdentifier {
        /// The rejected identifier.
        identifier: String,
    },

    /// A pack migration statement failed to apply.
    MigrationApplyFailed {
        /// The migration id from the manifest.
        migration_id: String,
        /// The underlying database error.
        detail: String,
    },

    /// An entity lookup returned no row.
    NotFound {
        /// Entity kind (e.g. "run", "pack").
        entity: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// A unique or foreign-key constraint rejected a write.
    ConstraintViolation {
        /// Database detail.
        detail: String,
    },

    /// A write conflicted with concurrent state.
    Conflict {
        /// What conflicted.
        detail: String,
    },

    /// A database error that may succeed on retry.
    TransientDb {
        /// Database detail.
        detail: String,
    },

    /// Input validation failed.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation message.
        message: String,
    },
}

impl XynError {
    /// Stable snake_case kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LostLease { .. } => "lost_lease",
            Self::RunDeadlineExceeded { .. } => "run_deadline_exceeded",
            Self::StepBudgetExceeded { .. } => "step_budget_exceeded",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::HandlerCrash { .. } => "handler_crash",
            Self::StepHandlerError { .. } => "step_handler_error",
            Self::TemplateResolution { .. } => "template_resolution_error",
            Self::BlueprintNotFound { .. } => "blueprint_not_found",
            Self::PackNotFound { .. } => "pack_not_found",
            Self::PackAlreadyInstalled { .. } => "pack_already_installed",
            Self::InstallationInProgress { .. } => "installation_in_progress",
            Self::InstallationPreviouslyFailed { .. } => "installation_previously_failed",
            Self::ConflictingState { .. } => "conflicting_state",
            Self::OwnershipViolation { .. } => "ownership_violation",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::MigrationApplyFailed { .. } => "migration_apply_failed",
            Self::NotFound { .. } => "not_found",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::Conflict { .. } => "conflict",
            Self::TransientDb { .. } => "transient_db_error",
            Self::Validation { .. } => "validation_error",
        }
    }

    /// Whether a statement-level retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDb { .. })
    }

    /// Whether the run-level retry policy must be bypassed: the failure is
    /// deterministic or the transaction state is unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RunDeadlineExceeded { .. }
                | Self::StepBudgetExceeded { .. }
                | Self::BlueprintNotFound { .. }
                | Self::OwnershipViolation { .. }
                | Self::InvariantViolation { .. }
                | Self::InvalidIdentifier { .. }
                | Self::PackAlreadyInstalled { .. }
                | Self::InstallationInProgress { .. }
                | Self::InstallationPreviouslyFailed { .. }
                | Self::ConflictingState { .. }
        ) || matches!(self, Self::StepHandlerError { source, .. } if source.is_fatal())
    }

    /// JSON payload written into `runs.error` / `steps.error` columns.
    pub fn payload(&self) -> Value {
        let mut payload = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        let extra = match self {
            Self::StepHandlerError { step_name, source } => {
                json!({ "step": step_name, "cause": source.payload() })
            }
            Self::PackAlreadyInstalled {
                installation_id,
                installed_by_run_id,
                ..
            } => json!({
                "existing_installation_id": installation_id,
                "existing_run_id": installed_by_run_id,
            }),
            Self::InstallationInProgress {
                installation_id,
                installing_run_id,
                ..
            } => json!({
                "existing_installation_id": installation_id,
                "existing_run_id": installing_run_id,
            }),
            Self::InstallationPreviouslyFailed {
                installation_id,
                error_details,
                last_error_at,
                ..
            } => json!({
                "existing_installation_id": installation_id,
                "error_details": error_details,
                "last_error_at": last_error_at,
            }),
            Self::ConflictingState {
                installation_id,
                status,
                ..
            } => json!({
                "existing_installation_id": installation_id,
                "status": status,
            }),
            Self::TemplateResolution { expression, .. } => {
                json!({ "expression": expression })
            }
            _ => Value::Null,
        };
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        payload
    }
}

impl fmt::Display for XynError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LostLease { run_id } => {
                write!(f, "Lost lease for run '{}'", run_id)
            }
            Self::RunDeadlineExceeded {
                run_id,
                limit_seconds,
            } => {
                write!(
                    f,
                    "Run '{}' exceeded its {}s wall-clock deadline",
                    run_id, limit_seconds
                )
            }
            Self::StepBudgetExceeded { run_id, budget } => {
                write!(f, "Run '{}' exceeded its budget of {} steps", run_id, budget)
            }
            Self::RunCancelled { run_id } => {
                write!(f, "Run '{}' was cancelled", run_id)
            }
            Self::HandlerCrash { detail } => {
                write!(f, "Step handler crashed: {}", detail)
            }
            Self::StepHandlerError { step_name, source } => {
                write!(f, "Step '{}' failed: {}", step_name, source)
            }
            Self::TemplateResolution { expression, detail } => {
                write!(f, "Cannot resolve template '{}': {}", expression, detail)
            }
            Self::BlueprintNotFound { blueprint_ref } => {
                write!(f, "Blueprint not found: {}", blueprint_ref)
            }
            Self::PackNotFound { pack_ref } => {
                write!(f, "Pack not found: {}", pack_ref)
            }
            Self::PackAlreadyInstalled {
                pack_ref, env_id, ..
            } => {
                write!(
                    f,
                    "Pack '{}' is already installed in environment '{}'",
                    pack_ref, env_id
                )
            }
            Self::InstallationInProgress {
                pack_ref, env_id, ..
            } => {
                write!(
                    f,
                    "Pack '{}' installation is already in progress in environment '{}'",
                    pack_ref, env_id
                )
            }
            Self::InstallationPreviouslyFailed {
                pack_ref, env_id, ..
            } => {
                write!(
                    f,
                    "Pack '{}' installation previously failed in environment '{}'",
                    pack_ref, env_id
                )
            }
            Self::ConflictingState {
                pack_ref, status, ..
            } => {
                write!(
                    f,
                    "Pack '{}' installation is in conflicting state '{}'",
                    pack_ref, status
                )
            }
            Self::OwnershipViolation {
                installation_id,
                expected_run_id,
                actual_run_id,
            } => {
                write!(
                    f,
                    "Installation '{}' is owned by run {:?}, not '{}'",
                    installation_id, actual_run_id, expected_run_id
                )
            }
            Self::InvariantViolation { detail } => {
                write!(f, "Invariant violation: {}", detail)
            }
            Self::InvalidIdentifier { identifier } => {
                write!(f, "Invalid identifier: '{}'", identifier)
            }
            Self::MigrationApplyFailed {
                migration_id,
                detail,
            } => {
                write!(f, "Migration '{}' failed to apply: {}", migration_id, detail)
            }
            Self::NotFound { entity, id } => {
                write!(f, "{} '{}' not found", entity, id)
            }
            Self::ConstraintViolation { detail } => {
                write!(f, "Constraint violation: {}", detail)
            }
            Self::Conflict { detail } => {
                write!(f, "Conflict: {}", detail)
            }
            Self::TransientDb { detail } => {
                write!(f, "Transient database error: {}", detail)
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for XynError {}

impl From<sqlx::Error> for XynError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => XynError::NotFound {
                entity: "row",
                id: String::new(),
            },
            sqlx::Error::Database(db) => {
                if db.is_check_violation() {
                    XynError::InvariantViolation {
                        detail: db.message().to_string(),
                    }
                } else if db.is_unique_violation() || db.is_foreign_key_violation() {
                    XynError::ConstraintViolation {
                        detail: db.message().to_string(),
                    }
                } else {
                    XynError::TransientDb {
                        detail: db.message().to_string(),
                    }
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                XynError::TransientDb {
                    detail: err.to_string(),
                }
            }
            _ => XynError::TransientDb {
                detail: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for XynError {
    fn from(err: serde_json::Error) -> Self {
        XynError::Validation {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        let cases: Vec<(XynError, &str)> = vec![
            (
                XynError::LostLease {
                    run_id: Uuid::nil(),
                },
                "lost_lease",
            ),
            (
                XynError::BlueprintNotFound {
                    blueprint_ref: "x@v1".to_string(),
                },
                "blueprint_not_found",
            ),
            (
                XynError::InvalidIdentifier {
                    identifier: "drop table".to_string(),
                },
                "invalid_identifier",
            ),
            (
                XynError::TransientDb {
                    detail: "timeout".to_string(),
                },
                "transient_db_error",
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.kind(), expected);
        }
    }

    #[test]
    fn test_step_handler_error_payload_nests_cause() {
        let inner = XynError::TemplateResolution {
            expression: "{{inputs.x}}".to_string(),
            detail: "missing key".to_string(),
        };
        let err = XynError::StepHandlerError {
            step_name: "Resolve".to_string(),
            source: Box::new(inner),
        };
        let payload = err.payload();
        assert_eq!(payload["kind"], "step_handler_error");
        assert_eq!(payload["step"], "Resolve");
        assert_eq!(payload["cause"]["kind"], "template_resolution_error");
        assert_eq!(payload["cause"]["expression"], "{{inputs.x}}");
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = XynError::InvariantViolation {
            detail: "x".to_string(),
        };
        assert!(fatal.is_fatal());

        let wrapped = XynError::StepHandlerError {
            step_name: "Finalize".to_string(),
            source: Box::new(fatal),
        };
        assert!(wrapped.is_fatal());

        let retryable = XynError::TransientDb {
            detail: "connection reset".to_string(),
        };
        assert!(!retryable.is_fatal());
        assert!(retryable.is_transient());
    }

    #[test]
    fn test_conflict_payload_carries_existing_installation() {
        let id = Uuid::new_v4();
        let run = Uuid::new_v4();
        let err = XynError::InstallationInProgress {
            pack_ref: "core.domain@v1".to_string(),
            env_id: "local-dev".to_string(),
            installation_id: id,
            installing_run_id: Some(run),
        };
        let payload = err.payload();
        assert_eq!(payload["existing_installation_id"], json!(id));
        assert_eq!(payload["existing_run_id"], json!(run));
    }
}
