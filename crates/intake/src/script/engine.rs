//! Checks user scripts before they are stored and runs them against jobs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::rhai_runtime::RhaiRuntime;
use super::runtime::{ScriptLimits, ScriptRuntime};
use super::types::{
    ExportArtifact, ExportFailure, ExportScript, NewExportScript, NewValidationScript,
    RuleOutcome, ScriptKind, ValidationScript,
};
use crate::error::ScriptError;
use crate::ports::ScriptRepository;

/// Extra time granted on top of the script deadline before the engine stops
/// waiting for the blocking task.
const EXECUTION_GRACE: Duration = Duration::from_millis(250);

/// Runs user scripts through a `ScriptRuntime` with time limits and fault
/// isolation. Cheap to clone.
#[derive(Clone)]
pub struct ScriptEngine {
    runtime: Arc<dyn ScriptRuntime>,
    limits: ScriptLimits,
}

impl ScriptEngine {
    pub fn new(runtime: Arc<dyn ScriptRuntime>, limits: ScriptLimits) -> Self {
        Self { runtime, limits }
    }

    /// Engine backed by the bundled Rhai runtime.
    pub fn rhai(limits: ScriptLimits) -> Self {
        Self::new(Arc::new(RhaiRuntime::new()), limits)
    }

    pub fn limits(&self) -> &ScriptLimits {
        &self.limits
    }

    /// Parses `source` and checks it defines the entry point for `kind`.
    pub fn validate_syntax(&self, source: &str, kind: ScriptKind) -> Result<(), ScriptError> {
        self.runtime.check(source, kind.entry_point())
    }

    /// Runs a script on the blocking pool and waits at most the configured
    /// timeout (plus a short grace period) for it.
    pub async fn run(
        &self,
        source: &str,
        kind: ScriptKind,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let runtime = Arc::clone(&self.runtime);
        let limits = self.limits.clone();
        let source = source.to_string();
        let entry = kind.entry_point();
        let limit_ms = self.limits.timeout.as_millis() as u64;

        let handle =
            tokio::task::spawn_blocking(move || runtime.call(&source, entry, &args, &limits));

        match tokio::time::timeout(self.limits.timeout + EXECUTION_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ScriptError::Runtime(format!(
                "script execution aborted: {}",
                join_err
            ))),
            Err(_) => Err(ScriptError::Timeout { limit_ms }),
        }
    }

    /// Runs one validation script. Faults are reported as a failed outcome of
    /// that script carrying the script's own severity.
    pub async fn run_validation(&self, script: &ValidationScript, data: &Value) -> Vec<RuleOutcome> {
        let result = self
            .run(&script.script, ScriptKind::Validation, vec![data.clone()])
            .await
            .and_then(|value| parse_outcomes(value, script));

        match result {
            Ok(outcomes) => {
                debug!(
                    script = %script.name,
                    rules = outcomes.len(),
                    failed = outcomes.iter().filter(|o| !o.passed).count(),
                    "Validation script finished"
                );
                outcomes
            }
            Err(err) => {
                warn!(script = %script.name, error = %err, "Validation script failed");
                vec![RuleOutcome {
                    script_id: script.id,
                    script_name: script.name.clone(),
                    rule: "script_error".to_string(),
                    field: None,
                    passed: false,
                    message: err.to_string(),
                    severity: script.severity,
                }]
            }
        }
    }

    /// Runs one export script and returns its rows as a named artifact.
    pub async fn run_export(
        &self,
        script: &ExportScript,
        data: &Value,
        context: &Value,
    ) -> Result<ExportArtifact, ExportFailure> {
        let result = self
            .run(
                &script.script,
                ScriptKind::Export,
                vec![data.clone(), context.clone()],
            )
            .await
            .and_then(|value| parse_rows(value, self.limits.max_rows));

        match result {
            Ok(rows) => {
                debug!(script = %script.name, rows = rows.len(), "Export script finished");
                Ok(ExportArtifact {
                    script_id: script.id,
                    script_name: script.name.clone(),
                    rows,
                })
            }
            Err(err) => {
                warn!(script = %script.name, error = %err, "Export script failed");
                Err(ExportFailure {
                    script_id: script.id,
                    script_name: script.name.clone(),
                    error: err.to_string(),
                })
            }
        }
    }

    /// Persists a validation script after its syntax has been checked. A
    /// script that does not parse never reaches the repository.
    pub async fn save_validation_script(
        &self,
        repo: &dyn ScriptRepository,
        draft: NewValidationScript,
    ) -> Result<ValidationScript, ScriptError> {
        self.validate_syntax(&draft.script, ScriptKind::Validation)?;
        Ok(repo.insert_validation_script(&draft).await?)
    }

    /// Persists an export script after its syntax has been checked.
    pub async fn save_export_script(
        &self,
        repo: &dyn ScriptRepository,
        draft: NewExportScript,
    ) -> Result<ExportScript, ScriptError> {
        self.validate_syntax(&draft.script, ScriptKind::Export)?;
        Ok(repo.insert_export_script(&draft).await?)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Accepts `()`/`true` (all passed), `false` (one failure) or an array of
/// rule maps `#{ rule, field, passed, message, severity }`.
fn parse_outcomes(value: Value, script: &ValidationScript) -> Result<Vec<RuleOutcome>, ScriptError> {
    let outcome = |rule: String, field: Option<String>, passed: bool, message: String, severity| {
        RuleOutcome {
            script_id: script.id,
            script_name: script.name.clone(),
            rule,
            field,
            passed,
            message,
            severity,
        }
    };

    match value {
        Value::Null | Value::Bool(true) => Ok(Vec::new()),
        Value::Bool(false) => Ok(vec![outcome(
            script.name.clone(),
            None,
            false,
            "validation failed".to_string(),
            script.severity,
        )]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let map = match item {
                    Value::Object(map) => map,
                    other => {
                        return Err(ScriptError::InvalidResult(format!(
                            "rule {} is a {}, expected an object",
                            i + 1,
                            json_type(&other)
                        )))
                    }
                };
                let passed = map.get("passed").and_then(Value::as_bool).unwrap_or(false);
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        let default = if passed { "ok" } else { "validation failed" };
                        default.to_string()
                    });
                let severity = map
                    .get("severity")
                    .and_then(Value::as_str)
                    .and_then(super::types::Severity::parse)
                    .unwrap_or(script.severity);
                Ok(outcome(
                    map.get("rule")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("rule_{}", i + 1)),
                    map.get("field").and_then(Value::as_str).map(str::to_string),
                    passed,
                    message,
                    severity,
                ))
            })
            .collect(),
        other => Err(ScriptError::InvalidResult(format!(
            "expected an array of rule results, got {}",
            json_type(&other)
        ))),
    }
}

fn parse_rows(value: Value, max_rows: usize) -> Result<Vec<Map<String, Value>>, ScriptError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(ScriptError::InvalidResult(format!(
                "expected an array of rows, got {}",
                json_type(&other)
            )))
        }
    };
    if items.len() > max_rows {
        return Err(ScriptError::InvalidResult(format!(
            "returned {} rows, limit is {}",
            items.len(),
            max_rows
        )));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(ScriptError::InvalidResult(format!(
                "row {} is a {}, expected an object",
                i + 1,
                json_type(&other)
            ))),
        })
        .collect()
}
