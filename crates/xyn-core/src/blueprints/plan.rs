// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative linear plans.
//!
//! A plan is an ordered list of step specs compiled once at construction:
//! ids must be unique, handlers must be registered, and `gate` steps are
//! rejected (v0 has no manual-wait execution). At run time each step's
//! params resolve against the template scope before its handler is invoked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::artifact_store::StepLogCapture;
use crate::error::{Result, XynError};
use crate::executor::{RunContext, StepScope};
use crate::model::StepKind;
use crate::template::{self, TemplateScope};

use super::Blueprint;

/// One step in a declarative plan.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Plan-local id; prior outputs are referenced as `{{steps.<id>.outputs.*}}`.
    pub id: String,
    /// Human step name.
    pub name: String,
    /// Step kind discriminator.
    pub kind: StepKind,
    /// Handler name resolved through the handler registry.
    pub handler: String,
    /// Parameters; may reference inputs and prior step outputs.
    pub params: Value,
}

/// A step handler: a small object owning its inputs and outputs.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute with resolved inputs, returning the step outputs.
    async fn call(&self, scope: &StepScope, inputs: Value) -> Result<Value>;
}

/// Registry of step handlers keyed by name.
pub struct StepHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("core.echo", Arc::new(EchoHandler));
        registry.register("core.fail", Arc::new(FailHandler));
        registry.register("core.log", Arc::new(LogHandler));
        registry
    }

    /// Register a handler under a name.
    pub fn register(&mut self, name: &str, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }
}

impl Default for StepHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Echoes its resolved inputs as outputs.
struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    async fn call(&self, _scope: &StepScope, inputs: Value) -> Result<Value> {
        Ok(inputs)
    }
}

/// Captures `lines` into a step log artifact and links it to the step.
struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    async fn call(&self, scope: &StepScope, inputs: Value) -> Result<Value> {
        let mut capture = StepLogCapture::new(
            scope.step_id,
            scope.run_id,
            &scope.correlation_id,
            &scope.env_id,
        );
        match inputs.get("lines").and_then(Value::as_array) {
            Some(lines) => {
                for line in lines {
                    match line {
                        Value::String(s) => capture.write(s),
                        other => capture.write(&other.to_string()),
                    }
                }
            }
            None => {
                return Err(XynError::Validation {
                    field: "lines".to_string(),
                    message: "core.log requires a 'lines' array".to_string(),
                })
            }
        }
        let line_count = capture.len();
        let artifact = capture.finalize(scope.pool(), scope.artifacts()).await?;
        Ok(json!({
            "artifact_id": artifact.id,
            "sha256": artifact.sha256,
            "byte_length": artifact.byte_length,
            "line_count": line_count,
        }))
    }
}

/// Always fails with the configured message. Exercises the failure path.
struct FailHandler;

#[async_trait]
impl StepHandler for FailHandler {
    async fn call(&self, _scope: &StepScope, inputs: Value) -> Result<Value> {
        let message = inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed by request")
            .to_string();
        Err(XynError::Validation {
            field: "core.fail".to_string(),
            message,
        })
    }
}

/// A blueprint backed by a compiled linear plan.
pub struct PlanBlueprint {
    steps: Vec<StepSpec>,
    handlers: Arc<StepHandlerRegistry>,
}

impl std::fmt::Debug for PlanBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanBlueprint")
            .field("steps", &self.steps)
            .finish()
    }
}

impl PlanBlueprint {
    /// Compile a plan: validates unique ids, registered handlers, and
    /// rejects `gate` steps.
    pub fn new(steps: Vec<StepSpec>, handlers: Arc<StepHandlerRegistry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &steps {
            if !seen.insert(spec.id.clone()) {
                return Err(XynError::Validation {
                    field: "steps".to_string(),
                    message: format!("duplicate step id '{}'", spec.id),
                });
            }
            if spec.kind == StepKind::Gate {
                return Err(XynError::Validation {
                    field: "steps".to_string(),
                    message: format!("step '{}' has kind 'gate', not executable in plans", spec.id),
                });
            }
            if handlers.get(&spec.handler).is_none() {
                return Err(XynError::Validation {
                    field: "steps".to_string(),
                    message: format!(
                        "step '{}' references unregistered handler '{}'",
                        spec.id, spec.handler
                    ),
                });
            }
        }
        Ok(Self { steps, handlers })
    }

    /// Compile from a JSON definition `{"steps": [{id, name, kind, handler, params}]}`.
    pub fn from_definition(
        definition: &Value,
        handlers: Arc<StepHandlerRegistry>,
    ) -> Result<Self> {
        let raw_steps = definition
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| XynError::Validation {
                field: "definition".to_string(),
                message: "missing 'steps' array".to_string(),
            })?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (position, raw) in raw_steps.iter().enumerate() {
            let field = |key: &str| -> Result<String> {
                raw.get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| XynError::Validation {
                        field: "definition".to_string(),
                        message: format!("step {} is missing '{}'", position, key),
                    })
            };
            let id = field("id")?;
            let kind: StepKind = field("kind")?
                .parse()
                .map_err(|message: String| XynError::Validation {
                    field: "definition".to_string(),
                    message,
                })?;
            steps.push(StepSpec {
                name: raw
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&id)
                    .to_string(),
                id,
                kind,
                handler: field("handler")?,
                params: raw.get("params").cloned().unwrap_or(Value::Null),
            });
        }
        Self::new(steps, handlers)
    }
}

#[async_trait]
impl Blueprint for PlanBlueprint {
    async fn run(&self, ctx: &mut RunContext, inputs: &Value) -> Result<Value> {
        let mut scope = TemplateScope::new(inputs.clone());
        let mut last_outputs = Value::Object(Default::default());

        for spec in &self.steps {
            let outputs = match template::resolve(&spec.params, &scope) {
                Ok(resolved) => {
                    let handler = self
                        .handlers
                        .get(&spec.handler)
                        .expect("handlers validated at compile time");
                    let handler_inputs = resolved.clone();
                    ctx.run_step(&spec.name, spec.kind, Some(resolved), move |step_scope| {
                        async move { handler.call(&step_scope, handler_inputs).await }
                    })
                    .await?
                }
                Err(err) => {
                    // Typed resolution failure surfaces as a step failure
                    // before the handler is invoked.
                    ctx.run_step(
                        &spec.name,
                        spec.kind,
                        Some(spec.params.clone()),
                        move |_step_scope| async move { Err(err) },
                    )
                    .await?
                }
            };

            scope.record_step(&spec.id, outputs.clone());
            last_outputs = outputs;
        }

        Ok(last_outputs)
    }
}
