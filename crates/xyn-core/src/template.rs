// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pure template resolution over a JSON tree.
//!
//! Step parameters reference run inputs and prior step outputs with
//! `{{inputs.x}}` and `{{steps.<id>.outputs.y}}`. A string that is exactly
//! one placeholder splices the referenced value; placeholders embedded in a
//! longer string interpolate scalars. No side effects; resolution errors are
//! typed and surface as step failures before the handler runs.

use serde_json::{Map, Value};

use crate::error::{Result, XynError};

/// Resolution scope: run inputs plus outputs of completed steps keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    /// The run's input payload.
    pub inputs: Value,
    /// Outputs of prior steps, keyed by step id from the plan.
    pub steps: Map<String, Value>,
}

impl TemplateScope {
    /// Scope with inputs only.
    pub fn new(inputs: Value) -> Self {
        Self {
            inputs,
            steps: Map::new(),
        }
    }

    /// Record a completed step's outputs under its plan id.
    pub fn record_step(&mut self, step_id: &str, outputs: Value) {
        self.steps.insert(step_id.to_string(), outputs);
    }

    fn lookup(&self, expression: &str) -> Result<Value> {
        let mut segments = expression.split('.');
        let root = segments.next().unwrap_or_default();

        let (mut current, rest): (&Value, Vec<&str>) = match root {
            "inputs" => (&self.inputs, segments.collect()),
            "steps" => {
                let step_id = segments.next().ok_or_else(|| XynError::TemplateResolution {
                    expression: expression.to_string(),
                    detail: "missing step id".to_string(),
                })?;
                let outputs =
                    self.steps
                        .get(step_id)
                        .ok_or_else(|| XynError::TemplateResolution {
                            expression: expression.to_string(),
                            detail: format!("no outputs recorded for step '{}'", step_id),
                        })?;
                match segments.next() {
                    Some("outputs") | None => (outputs, segments.collect()),
                    Some(other) => {
                        return Err(XynError::TemplateResolution {
                            expression: expression.to_string(),
                            detail: format!("expected 'outputs', found '{}'", other),
                        })
                    }
                }
            }
            other => {
                return Err(XynError::TemplateResolution {
                    expression: expression.to_string(),
                    detail: format!("unknown root '{}'", other),
                })
            }
        };

        for segment in rest {
            current = match current {
                Value::Object(map) => {
                    map.get(segment)
                        .ok_or_else(|| XynError::TemplateResolution {
                            expression: expression.to_string(),
                            detail: format!("missing key '{}'", segment),
                        })?
                }
                Value::Array(items) => {
                    let index: usize =
                        segment.parse().map_err(|_| XynError::TemplateResolution {
                            expression: expression.to_string(),
                            detail: format!("'{}' is not an array index", segment),
                        })?;
                    items.get(index).ok_or_else(|| XynError::TemplateResolution {
                        expression: expression.to_string(),
                        detail: format!("index {} out of bounds", index),
                    })?
                }
                _ => {
                    return Err(XynError::TemplateResolution {
                        expression: expression.to_string(),
                        detail: format!("cannot descend into scalar at '{}'", segment),
                    })
                }
            };
        }

        Ok(current.clone())
    }
}

/// Resolve all placeholders inside a parameter tree.
pub fn resolve(params: &Value, scope: &TemplateScope) -> Result<Value> {
    match params {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>> =
                items.iter().map(|item| resolve(item, scope)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, scope)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(input: &str, scope: &TemplateScope) -> Result<Value> {
    // Whole-string placeholder splices the referenced value as-is.
    let trimmed = input.trim();
    if let Some(expression) = whole_placeholder(trimmed) {
        return scope.lookup(expression);
    }

    // Otherwise interpolate scalar values into the surrounding text.
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find("}}").ok_or_else(|| XynError::TemplateResolution {
            expression: input.to_string(),
            detail: "unterminated placeholder".to_string(),
        })?;
        let expression = tail[..end].trim();
        let value = scope.lookup(expression)?;
        match value {
            Value::String(s) => output.push_str(&s),
            Value::Number(n) => output.push_str(&n.to_string()),
            Value::Bool(b) => output.push_str(if b { "true" } else { "false" }),
            Value::Null => {}
            _ => {
                return Err(XynError::TemplateResolution {
                    expression: expression.to_string(),
                    detail: "cannot interpolate a non-scalar into a string".to_string(),
                })
            }
        }
        rest = &tail[end + 2..];
    }
    output.push_str(rest);
    Ok(Value::String(output))
}

fn whole_placeholder(input: &str) -> Option<&str> {
    let inner = input.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> TemplateScope {
        let mut scope = TemplateScope::new(json!({
            "name": "demo",
            "count": 3,
            "nested": { "flag": true },
            "items": ["a", "b"],
        }));
        scope.record_step("fetch", json!({ "rows": 7, "payload": { "x": 1 } }));
        scope
    }

    #[test]
    fn test_whole_placeholder_splices_value() {
        let resolved = resolve(&json!("{{inputs.nested}}"), &scope()).unwrap();
        assert_eq!(resolved, json!({ "flag": true }));
    }

    #[test]
    fn test_whole_placeholder_inputs_root() {
        let resolved = resolve(&json!("{{inputs}}"), &scope()).unwrap();
        assert_eq!(resolved["name"], "demo");
    }

    #[test]
    fn test_interpolation() {
        let resolved = resolve(&json!("run {{inputs.name}} x{{inputs.count}}"), &scope()).unwrap();
        assert_eq!(resolved, json!("run demo x3"));
    }

    #[test]
    fn test_step_outputs_path() {
        let resolved = resolve(&json!("{{steps.fetch.outputs.rows}}"), &scope()).unwrap();
        assert_eq!(resolved, json!(7));

        let resolved = resolve(&json!("{{steps.fetch.outputs.payload.x}}"), &scope()).unwrap();
        assert_eq!(resolved, json!(1));
    }

    #[test]
    fn test_array_index() {
        let resolved = resolve(&json!("{{inputs.items.1}}"), &scope()).unwrap();
        assert_eq!(resolved, json!("b"));
    }

    #[test]
    fn test_nested_tree_resolution() {
        let params = json!({
            "a": "{{inputs.count}}",
            "b": ["{{inputs.name}}", 2],
            "c": { "d": "literal" },
        });
        let resolved = resolve(&params, &scope()).unwrap();
        assert_eq!(resolved, json!({ "a": 3, "b": ["demo", 2], "c": { "d": "literal" } }));
    }

    #[test]
    fn test_missing_key_is_typed_error() {
        let err = resolve(&json!("{{inputs.absent}}"), &scope()).unwrap_err();
        assert_eq!(err.kind(), "template_resolution_error");
    }

    #[test]
    fn test_unknown_step_is_typed_error() {
        let err = resolve(&json!("{{steps.nope.outputs.x}}"), &scope()).unwrap_err();
        assert_eq!(err.kind(), "template_resolution_error");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = resolve(&json!("broken {{inputs.name"), &scope()).unwrap_err();
        assert_eq!(err.kind(), "template_resolution_error");
    }

    #[test]
    fn test_non_scalar_interpolation_rejected() {
        let err = resolve(&json!("x {{inputs.nested}}"), &scope()).unwrap_err();
        assert_eq!(err.kind(), "template_resolution_error");
    }
}
