// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run executor: drives a claimed run through its blueprint.
//!
//! The executor owns the step lifecycle (insert, start, handler, terminal
//! transition), ownership guards, panic isolation, the wall-clock deadline,
//! the step budget, and the cooperative cancel check at step boundaries.
//! Terminal outcomes go through the queue engine's compare-and-swap
//! finalizers, so a worker that lost its lease can never write run state.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::artifact_store::LocalFsArtifactStore;
use crate::backoff::BackoffConfig;
use crate::blueprints::BlueprintRegistry;
use crate::config::CoreConfig;
use crate::error::{Result, XynError};
use crate::model::{RunRecord, StepKind, StepRecord};
use crate::queue::{self, FailOutcome, FinalizeOutcome};
use crate::store::events::{self, names, NewEvent};
use crate::store::{self, runs, steps};

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Environment id stamped on emitted events.
    pub env_id: String,
    /// Per-run wall-clock limit.
    pub run_deadline: Duration,
    /// Per-run step budget.
    pub max_steps: u32,
    /// Retry backoff for failed runs.
    pub backoff: BackoffConfig,
    /// Base directory of the content-addressed artifact store.
    pub artifacts_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            env_id: "local-dev".to_string(),
            run_deadline: Duration::from_secs(3600),
            max_steps: 200,
            backoff: BackoffConfig::default(),
            artifacts_dir: PathBuf::from("./artifacts"),
        }
    }
}

impl ExecutorConfig {
    /// Derive executor tunables from the core configuration.
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            env_id: config.env_id.clone(),
            run_deadline: config.run_deadline,
            max_steps: config.max_steps,
            backoff: config.backoff.clone(),
            artifacts_dir: config.artifacts_dir.clone(),
        }
    }
}

/// How a driven run ended, from this worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finalized as completed.
    Completed,
    /// Finalized as failed (terminal).
    Failed,
    /// Returned to the queue by the retry policy.
    Retried,
    /// Finalized as cancelled.
    Cancelled,
    /// Aborted locally without state writes; another worker owns the run.
    LostLease,
}

/// Handle passed into step handlers.
///
/// Carries everything a handler may need without borrowing the context:
/// the pool for database work and the identifiers for progress emission.
#[derive(Debug, Clone)]
pub struct StepScope {
    pool: PgPool,
    artifacts: LocalFsArtifactStore,
    /// The executing run.
    pub run_id: Uuid,
    /// The executing step row.
    pub step_id: Uuid,
    /// The run's correlation id.
    pub correlation_id: String,
    /// The run's actor.
    pub actor: String,
    /// Environment id.
    pub env_id: String,
}

impl StepScope {
    /// Database pool for handler-side work.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Content-addressed artifact store.
    pub fn artifacts(&self) -> &LocalFsArtifactStore {
        &self.artifacts
    }

    /// Emit `xyn.step.progress` with a free-form message.
    ///
    /// Retried at the statement level; a flaky connection should not fail
    /// the step over a progress line.
    pub async fn progress(&self, message: &str, progress: Option<f64>) -> Result<()> {
        store::with_retries("step.progress", || {
            let mut event = NewEvent::new(names::STEP_PROGRESS, &self.correlation_id);
            event.env_id = self.env_id.clone();
            event.actor = self.actor.clone();
            event.run_id = Some(self.run_id);
            event.step_id = Some(self.step_id);
            let mut data = json!({
                "step_id": self.step_id,
                "message": message,
            });
            if let Some(progress) = progress {
                data["progress"] = json!(progress);
            }
            event.data = data;
            let pool = self.pool.clone();
            async move { events::emit(&pool, event).await.map(|_| ()) }
        })
        .await
    }
}

/// Context handed to blueprint implementations.
pub struct RunContext {
    pool: PgPool,
    artifacts: LocalFsArtifactStore,
    /// Snapshot of the claimed run row.
    pub run: RunRecord,
    /// Correlation id propagated into every event.
    pub correlation_id: String,
    worker_id: String,
    env_id: String,
    max_steps: u32,
    steps_started: u32,
}

impl RunContext {
    fn new(pool: PgPool, run: RunRecord, worker_id: &str, config: &ExecutorConfig) -> Self {
        let correlation_id = run.correlation_id.clone();
        Self {
            pool,
            artifacts: LocalFsArtifactStore::new(config.artifacts_dir.clone()),
            run,
            correlation_id,
            worker_id: worker_id.to_string(),
            env_id: config.env_id.clone(),
            max_steps: config.max_steps,
            steps_started: 0,
        }
    }

    /// Database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Environment id.
    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    /// Assert that this worker still owns the run.
    ///
    /// Checked before every state write; a worker that lost its lease aborts
    /// locally and lets reclaim restore the row.
    pub async fn assert_ownership(&self) -> Result<()> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1
            FROM runs
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(self.run.id)
        .bind(&self.worker_id)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            return Err(XynError::LostLease {
                run_id: self.run.id,
            });
        }
        Ok(())
    }

    /// Emit a run-scoped event.
    pub async fn emit_event(&self, event_name: &str, data: Value) -> Result<Uuid> {
        self.assert_ownership().await?;
        let mut event = NewEvent::new(event_name, &self.correlation_id);
        event.env_id = self.env_id.clone();
        event.actor = self.run.actor.clone();
        event.run_id = Some(self.run.id);
        event.data = data;
        events::emit(&self.pool, event).await
    }

    /// Execute one step: insert the row, run the handler, write the terminal
    /// transition. Step events commit in the same transaction as the
    /// transition they record.
    ///
    /// Observes the cooperative cancel flag and the step budget before
    /// starting. A panicking handler is converted to a `handler_crash` step
    /// failure; its uncommitted writes never become visible.
    pub async fn run_step<F, Fut>(
        &mut self,
        name: &str,
        kind: StepKind,
        inputs: Option<Value>,
        handler: F,
    ) -> Result<Value>
    where
        F: FnOnce(StepScope) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        self.assert_ownership().await?;

        if runs::cancel_requested(&self.pool, self.run.id).await? {
            tracing::info!(run_id = %self.run.id, "Cancel observed at step boundary");
            return Err(XynError::RunCancelled {
                run_id: self.run.id,
            });
        }

        if self.steps_started >= self.max_steps {
            return Err(XynError::StepBudgetExceeded {
                run_id: self.run.id,
                budget: self.max_steps,
            });
        }
        self.steps_started += 1;

        let step = self.start_step(name, kind, inputs.as_ref()).await?;

        let scope = StepScope {
            pool: self.pool.clone(),
            artifacts: self.artifacts.clone(),
            run_id: self.run.id,
            step_id: step.id,
            correlation_id: self.correlation_id.clone(),
            actor: self.run.actor.clone(),
            env_id: self.env_id.clone(),
        };

        match AssertUnwindSafe(handler(scope)).catch_unwind().await {
            Ok(Ok(outputs)) => {
                self.complete_step(&step, &outputs).await?;
                Ok(outputs)
            }
            Ok(Err(err)) => {
                self.fail_step(&step, &err).await;
                Err(XynError::StepHandlerError {
                    step_name: name.to_string(),
                    source: Box::new(err),
                })
            }
            Err(panic) => {
                let crash = XynError::HandlerCrash {
                    detail: panic_message(&panic),
                };
                self.fail_step(&step, &crash).await;
                Err(crash)
            }
        }
    }

    async fn start_step(
        &self,
        name: &str,
        kind: StepKind,
        inputs: Option<&Value>,
    ) -> Result<StepRecord> {
        let mut tx = self.pool.begin().await?;
        let step = steps::insert_next(&mut tx, self.run.id, name, kind, inputs).await?;
        steps::mark_running(&mut tx, step.id).await?;

        let mut event = NewEvent::new(names::STEP_STARTED, &self.correlation_id);
        event.env_id = self.env_id.clone();
        event.actor = self.run.actor.clone();
        event.run_id = Some(self.run.id);
        event.step_id = Some(step.id);
        event.resource_type = Some("step".to_string());
        event.resource_id = Some(step.id.to_string());
        event.data = json!({
            "step_id": step.id,
            "step_name": name,
            "step_kind": kind.as_str(),
            "idx": step.idx,
        });
        events::emit(&mut *tx, event).await?;
        tx.commit().await?;

        tracing::debug!(run_id = %self.run.id, step_id = %step.id, idx = step.idx, name, "Step started");
        Ok(step)
    }

    async fn complete_step(&self, step: &StepRecord, outputs: &Value) -> Result<()> {
        self.assert_ownership().await?;

        let mut tx = self.pool.begin().await?;
        steps::mark_completed(&mut tx, step.id, outputs).await?;

        let mut event = NewEvent::new(names::STEP_COMPLETED, &self.correlation_id);
        event.env_id = self.env_id.clone();
        event.actor = self.run.actor.clone();
        event.run_id = Some(self.run.id);
        event.step_id = Some(step.id);
        event.resource_type = Some("step".to_string());
        event.resource_id = Some(step.id.to_string());
        event.data = json!({
            "step_id": step.id,
            "step_name": step.name,
        });
        events::emit(&mut *tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Best-effort: a lost lease while recording the failure must not mask
    /// the original error, so problems here are logged and swallowed.
    async fn fail_step(&self, step: &StepRecord, err: &XynError) {
        if let Err(guard) = self.assert_ownership().await {
            tracing::warn!(
                run_id = %self.run.id,
                step_id = %step.id,
                error = %guard,
                "Lost ownership while marking step failed"
            );
            return;
        }

        let payload = err.payload();
        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            steps::mark_failed(&mut tx, step.id, &payload).await?;

            let mut event = NewEvent::new(names::STEP_FAILED, &self.correlation_id);
            event.env_id = self.env_id.clone();
            event.actor = self.run.actor.clone();
            event.run_id = Some(self.run.id);
            event.step_id = Some(step.id);
            event.resource_type = Some("step".to_string());
            event.resource_id = Some(step.id.to_string());
            event.data = json!({
                "step_id": step.id,
                "step_name": step.name,
                "error": payload,
            });
            events::emit(&mut *tx, event).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(write_err) = result {
            tracing::error!(
                run_id = %self.run.id,
                step_id = %step.id,
                error = %write_err,
                "Failed to record step failure"
            );
        }
    }

    /// Spawn a child run, idempotently when `child_key` is given.
    ///
    /// The child row, its lineage edge and the creation event commit in one
    /// transaction; a conflicting key returns the existing child instead of
    /// creating an orphan.
    pub async fn spawn_run(
        &self,
        blueprint_ref: &str,
        inputs: Value,
        child_key: Option<&str>,
        priority: Option<i32>,
    ) -> Result<Uuid> {
        self.assert_ownership().await?;

        if let Some(key) = child_key {
            if let Some(edge) = runs::find_edge(&self.pool, self.run.id, key).await? {
                tracing::info!(
                    run_id = %self.run.id,
                    child_run_id = %edge.child_run_id,
                    child_key = key,
                    "Child run already spawned"
                );
                return Ok(edge.child_run_id);
            }
        }

        let mut new = runs::NewRun::new(blueprint_ref, inputs);
        new.actor = self.run.actor.clone();
        new.correlation_id = Some(self.correlation_id.clone());
        new.env_id = self.env_id.clone();
        new.priority = priority.unwrap_or(self.run.priority);
        new.parent_run_id = Some(self.run.id);

        let spawned: Result<Uuid> = async {
            let mut tx = self.pool.begin().await?;
            let child = runs::insert_queued(&mut tx, &new).await?;
            runs::insert_edge(&mut tx, self.run.id, child.id, "child", child_key).await?;

            let mut event = NewEvent::new(names::RUN_CREATED, &child.correlation_id);
            event.env_id = self.env_id.clone();
            event.actor = child.actor.clone();
            event.run_id = Some(child.id);
            event.resource_type = Some("run".to_string());
            event.resource_id = Some(child.id.to_string());
            event.data = json!({
                "name": child.name,
                "parent_run_id": self.run.id,
                "child_key": child_key,
            });
            events::emit(&mut *tx, event).await?;
            tx.commit().await?;
            Ok(child.id)
        }
        .await;

        match spawned {
            Ok(child_id) => Ok(child_id),
            Err(XynError::ConstraintViolation { .. }) if child_key.is_some() => {
                // Raced another spawn with the same key.
                let edge = runs::find_edge(&self.pool, self.run.id, child_key.unwrap())
                    .await?
                    .ok_or(XynError::Conflict {
                        detail: "spawn conflict without a matching edge".to_string(),
                    })?;
                Ok(edge.child_run_id)
            }
            Err(err) => Err(err),
        }
    }
}

/// Execute an already-claimed run to a terminal outcome.
///
/// The caller (worker) holds the lease and keeps renewing it; this function
/// never writes terminal state it does not own.
pub async fn execute_run(
    pool: &PgPool,
    registry: &BlueprintRegistry,
    config: &ExecutorConfig,
    run_id: Uuid,
    worker_id: &str,
) -> Result<RunOutcome> {
    let run = runs::get(pool, run_id).await?.ok_or(XynError::NotFound {
        entity: "run",
        id: run_id.to_string(),
    })?;

    let blueprint = match registry.resolve_for_run(&run) {
        Ok(blueprint) => blueprint,
        Err(err) => {
            tracing::error!(run_id = %run.id, error = %err, "No blueprint for run");
            return match queue::finalize_failed(pool, run.id, worker_id, &err.payload(), &config.env_id)
                .await?
            {
                FinalizeOutcome::Applied => Ok(RunOutcome::Failed),
                FinalizeOutcome::LostLease => Ok(RunOutcome::LostLease),
            };
        }
    };

    tracing::info!(
        run_id = %run.id,
        name = %run.name,
        attempt = run.attempt,
        correlation_id = %run.correlation_id,
        "Executing run"
    );

    let mut ctx = RunContext::new(pool.clone(), run.clone(), worker_id, config);

    let guarded = AssertUnwindSafe(blueprint.run(&mut ctx, &run.inputs)).catch_unwind();
    let result: Result<Value> = match tokio::time::timeout(config.run_deadline, guarded).await {
        Err(_) => Err(XynError::RunDeadlineExceeded {
            run_id: run.id,
            limit_seconds: config.run_deadline.as_secs(),
        }),
        Ok(Err(panic)) => Err(XynError::HandlerCrash {
            detail: panic_message(&panic),
        }),
        Ok(Ok(inner)) => inner,
    };

    match result {
        Ok(outputs) => {
            match queue::finalize_completed(pool, run.id, worker_id, &outputs, &config.env_id)
                .await?
            {
                FinalizeOutcome::Applied => Ok(RunOutcome::Completed),
                FinalizeOutcome::LostLease => Ok(RunOutcome::LostLease),
            }
        }
        Err(XynError::RunCancelled { .. }) => {
            match queue::finalize_cancelled(pool, run.id, worker_id, &config.env_id).await? {
                FinalizeOutcome::Applied => Ok(RunOutcome::Cancelled),
                FinalizeOutcome::LostLease => Ok(RunOutcome::LostLease),
            }
        }
        Err(XynError::LostLease { .. }) => {
            tracing::warn!(run_id = %run.id, "Lost lease during execution, aborting locally");
            Ok(RunOutcome::LostLease)
        }
        Err(err) if err.is_fatal() => {
            tracing::error!(run_id = %run.id, error = %err, "Run failed terminally");
            match queue::finalize_failed(pool, run.id, worker_id, &err.payload(), &config.env_id)
                .await?
            {
                FinalizeOutcome::Applied => Ok(RunOutcome::Failed),
                FinalizeOutcome::LostLease => Ok(RunOutcome::LostLease),
            }
        }
        Err(err) => {
            tracing::warn!(run_id = %run.id, error = %err, "Run failed, consulting retry policy");
            match queue::fail_or_retry(
                pool,
                &run,
                worker_id,
                &err.payload(),
                &config.backoff,
                &config.env_id,
            )
            .await?
            {
                FailOutcome::Retried { .. } => Ok(RunOutcome::Retried),
                FailOutcome::Failed => Ok(RunOutcome::Failed),
                FailOutcome::LostLease => Ok(RunOutcome::LostLease),
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step handler panicked".to_string()
    }
}
