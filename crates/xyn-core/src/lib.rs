// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Xyn Core - Durable Run Queue and Executor
//!
//! This crate provides an at-least-once job runtime backed by a single
//! PostgreSQL database. A submitted run executes a named blueprint as an
//! ordered sequence of steps, with an append-only event stream, persisted
//! artifacts and lease-based crash recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                 │
//! │                        (xyn-api, seeding CLI)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ enqueue (status = queued)
//!                                    ▼
//! ┌───────────────────────┐   claim / renew / reclaim   ┌───────────────────┐
//! │     Queue Engine      │◄────────────────────────────│   Worker Slots    │
//! │  FOR UPDATE SKIP      │                             │ (one run at a     │
//! │  LOCKED + leases      │────────────────────────────►│  time per slot)   │
//! └───────────────────────┘          claimed run        └─────────┬─────────┘
//!           │                                                     │ steps
//!           ▼                                                     ▼
//! ┌───────────────────────┐                             ┌───────────────────┐
//! │      PostgreSQL       │◄────────────────────────────│   Run Executor    │
//! │ runs/steps/events/    │    transactional writes     │  + Blueprints     │
//! │ artifacts/packs       │                             └───────────────────┘
//! └───────────┬───────────┘
//!             │ indexed queries (5 s cadence)
//!             ▼
//! ┌───────────────────────┐
//! │  Metrics Collector    │
//! │  (process gauges)     │
//! └───────────────────────┘
//! ```
//!
//! # Run State Machine
//!
//! ```text
//!                  ┌────────┐
//!       enqueue ──►│ QUEUED │◄──────────────┐
//!                  └───┬────┘               │
//!                claim │          reclaim / │ retry
//!                      ▼                    │
//!                  ┌─────────┐──────────────┘
//!        ┌─────────│ RUNNING │─────────┐
//!        │         └────┬────┘         │
//!   complete          fail          cancel (cooperative)
//!        │              │              │
//!        ▼              ▼              ▼
//!  ┌───────────┐   ┌────────┐   ┌───────────┐
//!  │ COMPLETED │   │ FAILED │   │ CANCELLED │
//!  └───────────┘   └────────┘   └───────────┘
//! ```
//!
//! A `queued` run is eligible once `run_at <= now`. Claiming is one atomic
//! statement (`FOR UPDATE SKIP LOCKED`), so no two workers ever hold the
//! same run. A `running` row always carries `locked_by` and
//! `lease_expires_at`; when the lease expires the row is reclaimed back to
//! `queued` and the attempt counter keeps counting across claims.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `ENV_ID` | No | `local-dev` | Environment id on events/installations |
//! | `WORKER_ID` | No | `<host>-<pid>` | Identity stamped on `locked_by` |
//! | `LEASE_DURATION_SECONDS` | No | `60` | Run lease duration |
//! | `IDLE_POLL_MS` | No | `500` | Worker sleep when no claim |
//! | `METRICS_COLLECTOR_INTERVAL` | No | `5` | Collector tick seconds |
//! | `XYN_AUTO_CREATE_SCHEMA` | No | `true` | Run migrations at boot |
//! | `XYN_REQUIRED_MIGRATIONS` | No | - | Ledger ids required when off |
//! | `XYN_ARTIFACTS_DIR` | No | `./artifacts` | Artifact store base |
//! | `RETRY_BACKOFF_BASE_MS` | No | `1000` | Retry backoff base |
//! | `RETRY_BACKOFF_CAP_MS` | No | `60000` | Retry backoff cap |
//! | `RUN_DEADLINE_SECONDS` | No | `3600` | Per-run wall-clock limit |
//! | `MAX_STEPS_PER_RUN` | No | `200` | Per-run step budget |
//!
//! # Modules
//!
//! - [`config`]: configuration from environment variables
//! - [`error`]: error taxonomy with stable kind strings
//! - [`model`]: record types and status enums
//! - [`store`]: typed persistence per entity
//! - [`queue`]: claim/lease/reclaim/finalize/retry/cancel
//! - [`executor`]: step lifecycle, ownership guards, panic isolation
//! - [`blueprints`]: blueprint trait, registry, plans, pack installer
//! - [`template`]: parameter resolution over run inputs and step outputs
//! - [`artifact_store`]: content-addressed blob storage
//! - [`worker`]: claim/execute loop and reclaim cadence
//! - [`collector`]: periodic gauge updates
//! - [`migrations`]: embedded schema migrations and boot policy

#![deny(missing_docs)]

/// Content-addressed artifact storage and step log capture.
pub mod artifact_store;

/// Exponential full-jitter backoff for run retries.
pub mod backoff;

/// Blueprint trait, registry, declarative plans and the pack installer.
pub mod blueprints;

/// Periodic gauge updates over queue and lease state.
pub mod collector;

/// Configuration loaded from environment variables.
pub mod config;

/// Error taxonomy with stable snake_case kind strings.
pub mod error;

/// Run executor: step lifecycle, ownership guards and panic isolation.
pub mod executor;

/// Gauge names and registration.
pub mod metrics;

/// Embedded database migrations and the boot-time schema policy.
pub mod migrations;

/// Record types and status enums for the runtime tables.
pub mod model;

/// Queue/lease engine: claim, renew, reclaim, finalize, retry, cancel.
pub mod queue;

/// Typed persistence over the runtime tables.
pub mod store;

/// Pure template resolution for step parameters.
pub mod template;

/// Worker loop and reclaim cadence.
pub mod worker;
