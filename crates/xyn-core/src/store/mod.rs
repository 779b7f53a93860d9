// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed persistence over the runtime tables.
//!
//! Each submodule owns one entity and exposes free async functions over a
//! [`sqlx::PgPool`] or a transaction connection. Composite writes (a state
//! change plus its event) always share one transaction; functions that must
//! compose take `&mut PgConnection` so callers can pass `&mut *tx`.

pub mod artifacts;
pub mod events;
pub mod packs;
pub mod runs;
pub mod steps;

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, XynError};

/// Retry a statement up to 3 attempts on transient database errors.
///
/// Used on write paths invoked from inside step handlers, where a dropped
/// connection should not immediately fail the step.
pub async fn with_retries<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Err(err) if err.is_transient() && attempt < 2 => {
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    error = %err,
                    "transient database error, retrying statement"
                );
                tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
            }
            other => return other,
        }
    }
}

/// Map an optional row into a typed not-found error.
pub(crate) fn required<T>(row: Option<T>, entity: &'static str, id: String) -> Result<T> {
    row.ok_or(XynError::NotFound { entity, id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(XynError::TransientDb {
                        detail: "connection reset".to_string(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(XynError::TransientDb {
                    detail: "still down".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_deterministic_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(XynError::ConstraintViolation {
                    detail: "duplicate key".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
