// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gauge names for queue and lease health.
//!
//! Low-cardinality labels only: the single labelled gauge is keyed by run
//! status, never by run id or correlation id. Values are written by the
//! collector on a fixed cadence, never from hot paths.

use metrics::describe_gauge;

/// Run count by status.
pub const QUEUE_DEPTH: &str = "xyn_queue_depth";

/// Queued runs ready to execute (`run_at <= now`).
pub const QUEUE_READY_DEPTH: &str = "xyn_queue_ready_depth";

/// Queued runs scheduled for the future (`run_at > now`).
pub const QUEUE_FUTURE_DEPTH: &str = "xyn_queue_future_depth";

/// Age in seconds of the oldest ready queued run.
pub const QUEUE_OLDEST_READY_SECONDS: &str = "xyn_queue_oldest_ready_seconds";

/// Running runs whose lease has expired (should be ~0).
pub const RUNNING_WITH_EXPIRED_LEASE: &str = "xyn_running_with_expired_lease";

/// Running runs with an active lease.
pub const RUNNING_WITH_ACTIVE_LEASE: &str = "xyn_running_with_active_lease";

/// Register gauge descriptions with the installed recorder.
pub fn describe() {
    describe_gauge!(QUEUE_DEPTH, "Run count by status");
    describe_gauge!(
        QUEUE_READY_DEPTH,
        "Queued runs ready to execute (run_at <= now)"
    );
    describe_gauge!(
        QUEUE_FUTURE_DEPTH,
        "Queued runs scheduled for the future (run_at > now)"
    );
    describe_gauge!(
        QUEUE_OLDEST_READY_SECONDS,
        "Age in seconds of oldest ready queued run"
    );
    describe_gauge!(
        RUNNING_WITH_EXPIRED_LEASE,
        "RUNNING runs with expired leases (should be ~0)"
    );
    describe_gauge!(RUNNING_WITH_ACTIVE_LEASE, "RUNNING runs with active leases");
}
