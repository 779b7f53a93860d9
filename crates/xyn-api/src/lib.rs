// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Xyn API - HTTP/JSON surface over the run queue
//!
//! Versioned under `/api/v1`: events, runs, packs, plus `/health` and
//! `/metrics`. Pagination is cursor-based (`limit` + opaque `cursor`,
//! `next_cursor` in responses). Every response carries `x-correlation-id`.
//!
//! The process can colocate worker slots, the reclaim loop and the metrics
//! collector (see `XYN_EMBEDDED_WORKERS`), which makes a single-binary
//! deployment fully functional.

#![deny(missing_docs)]

/// API process configuration.
pub mod config;

/// API error type and response payloads.
pub mod error;

/// Prometheus recorder and the /metrics endpoint.
pub mod metrics;

/// Cursor pagination helpers.
pub mod pagination;

/// Routers and handlers.
pub mod routes;

/// Shared handler state.
pub mod state;
