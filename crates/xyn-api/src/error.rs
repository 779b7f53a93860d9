// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API error type and error response payloads.
//!
//! Errors render as `{"detail": ...}`: a string for plain errors, a typed
//! object for pack installation conflicts (409).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use xyn_core::error::XynError;

/// Result type using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

/// API-facing errors with their HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    /// 404 with a plain detail message.
    NotFound(String),
    /// 400 with a plain detail message.
    Validation(String),
    /// 409 with the typed pack-conflict detail body.
    Conflict(XynError),
    /// 500 with a plain detail message.
    Internal(String),
}

impl ApiError {
    fn status_and_detail(&self) -> (StatusCode, Value) {
        match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, json!(message)),
            Self::Validation(message) => (StatusCode::BAD_REQUEST, json!(message)),
            Self::Conflict(err) => (StatusCode::CONFLICT, conflict_detail(err)),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, json!(message)),
        }
    }
}

/// Typed 409 body for pack installation conflicts.
fn conflict_detail(err: &XynError) -> Value {
    let mut detail = json!({ "error": err.kind() });
    match err {
        XynError::PackAlreadyInstalled {
            installation_id,
            installed_by_run_id,
            ..
        } => {
            detail["existing_installation_id"] = json!(installation_id);
            detail["existing_run_id"] = json!(installed_by_run_id);
        }
        XynError::InstallationInProgress {
            installation_id,
            installing_run_id,
            ..
        } => {
            detail["existing_installation_id"] = json!(installation_id);
            detail["existing_run_id"] = json!(installing_run_id);
        }
        XynError::InstallationPreviouslyFailed {
            installation_id,
            error_details,
            last_error_at,
            ..
        } => {
            detail["existing_installation_id"] = json!(installation_id);
            detail["error_details"] = json!(error_details);
            detail["last_error_at"] = json!(last_error_at);
        }
        XynError::ConflictingState {
            installation_id,
            status,
            ..
        } => {
            detail["existing_installation_id"] = json!(installation_id);
            detail["status"] = json!(status);
        }
        _ => {
            detail["message"] = json!(err.to_string());
        }
    }
    detail
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = self.status_and_detail();
        if status.is_server_error() {
            tracing::error!(status = %status, detail = %detail, "Request failed");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<XynError> for ApiError {
    fn from(err: XynError) -> Self {
        match &err {
            XynError::NotFound { .. } | XynError::PackNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            XynError::Validation { .. } | XynError::InvalidIdentifier { .. } => {
                Self::Validation(err.to_string())
            }
            XynError::PackAlreadyInstalled { .. }
            | XynError::InstallationInProgress { .. }
            | XynError::InstallationPreviouslyFailed { .. }
            | XynError::ConflictingState { .. }
            | XynError::Conflict { .. } => Self::Conflict(err),
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_conflict_detail_shape_in_progress() {
        let installation_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let err = XynError::InstallationInProgress {
            pack_ref: "test.locking@v1".to_string(),
            env_id: "local-dev".to_string(),
            installation_id,
            installing_run_id: Some(run_id),
        };
        let detail = conflict_detail(&err);
        assert_eq!(detail["error"], "installation_in_progress");
        assert_eq!(detail["existing_installation_id"], json!(installation_id));
        assert_eq!(detail["existing_run_id"], json!(run_id));
    }

    #[test]
    fn test_conflict_detail_shape_previously_failed() {
        let err = XynError::InstallationPreviouslyFailed {
            pack_ref: "p@v1".to_string(),
            env_id: "local-dev".to_string(),
            installation_id: Uuid::new_v4(),
            error_details: Some(json!({ "kind": "migration_apply_failed" })),
            last_error_at: None,
        };
        let detail = conflict_detail(&err);
        assert_eq!(detail["error"], "installation_previously_failed");
        assert_eq!(detail["error_details"]["kind"], "migration_apply_failed");
    }

    #[test]
    fn test_status_mapping() {
        let not_found: ApiError = XynError::PackNotFound {
            pack_ref: "x@v1".to_string(),
        }
        .into();
        assert!(matches!(not_found, ApiError::NotFound(_)));

        let internal: ApiError = XynError::TransientDb {
            detail: "down".to_string(),
        }
        .into();
        assert!(matches!(internal, ApiError::Internal(_)));
    }
}
