// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blueprint trait and registry.
//!
//! A blueprint is a named, ordered plan of steps. Dispatch is by reference:
//! the run's `blueprint_ref` when set, otherwise its name; runs with neither
//! registered fall back to the registry default so ad-hoc submissions still
//! execute.

pub mod pack_install;
pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, XynError};
use crate::executor::RunContext;
use crate::model::{RunRecord, StepKind};

/// A named, executable plan of steps.
#[async_trait]
pub trait Blueprint: Send + Sync + std::fmt::Debug {
    /// Drive the run's steps to completion, returning the run outputs.
    async fn run(&self, ctx: &mut RunContext, inputs: &Value) -> Result<Value>;
}

/// Registry mapping blueprint references to implementations.
pub struct BlueprintRegistry {
    blueprints: HashMap<String, Arc<dyn Blueprint>>,
    default_ref: Option<String>,
}

impl BlueprintRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            blueprints: HashMap::new(),
            default_ref: None,
        }
    }

    /// Register a blueprint under a reference.
    pub fn register(&mut self, reference: &str, blueprint: Arc<dyn Blueprint>) {
        self.blueprints.insert(reference.to_string(), blueprint);
    }

    /// Set the fallback blueprint for runs without a registered reference.
    pub fn set_default(&mut self, reference: &str) {
        self.default_ref = Some(reference.to_string());
    }

    /// Look up a blueprint by reference.
    pub fn get(&self, reference: &str) -> Option<Arc<dyn Blueprint>> {
        self.blueprints.get(reference).cloned()
    }

    /// Registered references, for startup logging.
    pub fn references(&self) -> Vec<&str> {
        self.blueprints.keys().map(String::as_str).collect()
    }

    /// Resolve the blueprint for a run.
    ///
    /// An explicit `blueprint_ref` must resolve; a bare name falls back to
    /// the registry default when unregistered.
    pub fn resolve_for_run(&self, run: &RunRecord) -> Result<Arc<dyn Blueprint>> {
        if let Some(reference) = run.blueprint_ref.as_deref() {
            return self.get(reference).ok_or_else(|| XynError::BlueprintNotFound {
                blueprint_ref: reference.to_string(),
            });
        }
        if let Some(blueprint) = self.get(&run.name) {
            return Ok(blueprint);
        }
        if let Some(default_ref) = self.default_ref.as_deref() {
            if let Some(blueprint) = self.get(default_ref) {
                return Ok(blueprint);
            }
        }
        Err(XynError::BlueprintNotFound {
            blueprint_ref: run.name.clone(),
        })
    }
}

impl Default for BlueprintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference of the built-in echo blueprint, the registry default.
pub const ECHO_REF: &str = "core.echo@v1";

/// Registry with the built-in blueprints registered.
pub fn builtin_registry() -> BlueprintRegistry {
    let handlers = Arc::new(plan::StepHandlerRegistry::builtin());

    let echo = plan::PlanBlueprint::new(
        vec![plan::StepSpec {
            id: "echo".to_string(),
            name: "Echo inputs".to_string(),
            kind: StepKind::Transform,
            handler: "core.echo".to_string(),
            params: json!("{{inputs}}"),
        }],
        handlers.clone(),
    )
    .expect("builtin echo plan is valid");

    let mut registry = BlueprintRegistry::new();
    registry.register(ECHO_REF, Arc::new(echo));
    registry.register(
        pack_install::PACK_INSTALL_REF,
        Arc::new(pack_install::PackInstallBlueprint),
    );
    registry.set_default(ECHO_REF);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_named(name: &str, blueprint_ref: Option<&str>) -> RunRecord {
        use chrono::Utc;
        RunRecord {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            blueprint_ref: blueprint_ref.map(str::to_string),
            status: "queued".to_string(),
            actor: "test".to_string(),
            correlation_id: "corr".to_string(),
            inputs: json!({}),
            outputs: None,
            error: None,
            priority: 100,
            attempt: 0,
            max_attempts: None,
            run_at: Utc::now(),
            queued_at: Utc::now(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            locked_at: None,
            locked_by: None,
            lease_expires_at: None,
            cancel_requested: false,
            parent_run_id: None,
        }
    }

    #[test]
    fn test_resolve_by_name_and_ref() {
        let registry = builtin_registry();
        assert!(registry.resolve_for_run(&run_named(ECHO_REF, None)).is_ok());
        assert!(registry
            .resolve_for_run(&run_named("anything", Some(ECHO_REF)))
            .is_ok());
    }

    #[test]
    fn test_unregistered_name_falls_back_to_default() {
        let registry = builtin_registry();
        assert!(registry.resolve_for_run(&run_named("s1", None)).is_ok());
    }

    #[test]
    fn test_unknown_explicit_ref_is_error() {
        let registry = builtin_registry();
        let err = registry
            .resolve_for_run(&run_named("s1", Some("missing@v9")))
            .unwrap_err();
        assert_eq!(err.kind(), "blueprint_not_found");
    }
}
