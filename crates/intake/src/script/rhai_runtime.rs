//! Rhai-backed script runtime.
//!
//! Each call builds a fresh engine: no state leaks between scripts, module
//! imports resolve to nothing, `eval` is disabled and a progress hook
//! terminates scripts that run past their deadline.

use std::time::Instant;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;

use super::runtime::{ScriptLimits, ScriptRuntime};
use super::types::EntryPoint;
use crate::error::ScriptError;
use crate::sanitize::truncate;

const MAX_LOG_LINE: usize = 500;

#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiRuntime;

impl RhaiRuntime {
    pub fn new() -> Self {
        Self
    }

    fn engine(limits: &ScriptLimits, deadline: Option<Instant>) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(32);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_collection_size);
        engine.set_max_map_size(limits.max_collection_size);

        engine.on_print(|text| {
            tracing::debug!(target: "intake::script", "{}", truncate(text, MAX_LOG_LINE));
        });
        engine.on_debug(|text, _source, pos| {
            tracing::debug!(target: "intake::script", line = ?pos.line(), "{}", truncate(text, MAX_LOG_LINE));
        });

        if let Some(deadline) = deadline {
            engine.on_progress(move |_ops| {
                if Instant::now() >= deadline {
                    Some(Dynamic::UNIT)
                } else {
                    None
                }
            });
        }

        engine
    }

    fn compile(engine: &Engine, source: &str, entry: EntryPoint) -> Result<rhai::AST, ScriptError> {
        let ast = engine.compile(source).map_err(|e| ScriptError::Syntax {
            message: e.to_string(),
            line: e.position().line(),
        })?;

        let defined = ast
            .iter_functions()
            .any(|f| f.name == entry.name && f.params.len() == entry.arity);
        if !defined {
            return Err(ScriptError::MissingEntryPoint {
                name: entry.name,
                arity: entry.arity,
            });
        }

        Ok(ast)
    }

    fn classify(err: Box<EvalAltResult>, limits: &ScriptLimits) -> ScriptError {
        match *err {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => Self::classify(inner, limits),
            EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout {
                limit_ms: limits.timeout.as_millis() as u64,
            },
            EvalAltResult::ErrorTooManyOperations(..) => ScriptError::OperationLimit,
            other => ScriptError::Runtime(other.to_string()),
        }
    }
}

impl ScriptRuntime for RhaiRuntime {
    fn check(&self, source: &str, entry: EntryPoint) -> Result<(), ScriptError> {
        let engine = Self::engine(&ScriptLimits::default(), None);
        Self::compile(&engine, source, entry).map(|_| ())
    }

    fn call(
        &self,
        source: &str,
        entry: EntryPoint,
        args: &[Value],
        limits: &ScriptLimits,
    ) -> Result<Value, ScriptError> {
        if args.len() != entry.arity {
            return Err(ScriptError::Conversion(format!(
                "{} expects {} argument(s), got {}",
                entry.name,
                entry.arity,
                args.len()
            )));
        }

        let engine = Self::engine(limits, Some(Instant::now() + limits.timeout));
        let ast = Self::compile(&engine, source, entry)?;

        let dyn_args = args
            .iter()
            .map(rhai::serde::to_dynamic)
            .collect::<Result<Vec<Dynamic>, _>>()
            .map_err(|e| ScriptError::Conversion(e.to_string()))?;

        let mut scope = Scope::new();
        let result: Dynamic = engine
            .call_fn(&mut scope, &ast, entry.name, dyn_args)
            .map_err(|e| Self::classify(e, limits))?;

        rhai::serde::from_dynamic::<Value>(&result)
            .map_err(|e| ScriptError::InvalidResult(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_check_accepts_valid_script() {
        let src = r#"
            fn validate(data) {
                [ #{ rule: "total", passed: data.total > 0, message: "total must be positive" } ]
            }
        "#;
        assert!(RhaiRuntime.check(src, EntryPoint::VALIDATE).is_ok());
    }

    #[test]
    fn test_check_rejects_unbalanced_syntax() {
        let src = "fn validate(data) { [ #{ rule: \"x\" ";
        let err = RhaiRuntime.check(src, EntryPoint::VALIDATE).unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { .. }), "got {:?}", err);
    }

    #[test]
    fn test_check_requires_entry_point() {
        let err = RhaiRuntime
            .check("fn other(x) { x }", EntryPoint::VALIDATE)
            .unwrap_err();
        assert!(matches!(err, ScriptError::MissingEntryPoint { name: "validate", .. }));
    }

    #[test]
    fn test_call_round_trips_json() {
        let src = r#"
            fn export_rows(data, ctx) {
                let rows = [];
                for item in data.items {
                    rows.push(#{ name: item.name, file: ctx.filename });
                }
                rows
            }
        "#;
        let data = json!({ "items": [{ "name": "a" }, { "name": "b" }] });
        let ctx = json!({ "filename": "invoice.pdf" });
        let result = RhaiRuntime
            .call(
                src,
                EntryPoint::EXPORT_ROWS,
                &[data, ctx],
                &ScriptLimits::default(),
            )
            .unwrap();
        assert_eq!(
            result,
            json!([
                { "name": "a", "file": "invoice.pdf" },
                { "name": "b", "file": "invoice.pdf" }
            ])
        );
    }

    #[test]
    fn test_runaway_script_is_stopped() {
        let src = "fn validate(data) { loop { } }";
        let limits = ScriptLimits {
            timeout: Duration::from_millis(50),
            max_operations: 0,
            ..ScriptLimits::default()
        };
        let err = RhaiRuntime
            .call(src, EntryPoint::VALIDATE, &[json!({})], &limits)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout { limit_ms: 50 }), "got {:?}", err);
    }

    #[test]
    fn test_operation_budget() {
        let src = "fn validate(data) { let x = 0; loop { x += 1; } }";
        let limits = ScriptLimits {
            max_operations: 1_000,
            ..ScriptLimits::default()
        };
        let err = RhaiRuntime
            .call(src, EntryPoint::VALIDATE, &[json!({})], &limits)
            .unwrap_err();
        assert!(matches!(err, ScriptError::OperationLimit), "got {:?}", err);
    }

    #[test]
    fn test_eval_is_disabled() {
        let src = r#"fn validate(data) { eval("40 + 2") }"#;
        let outcome = RhaiRuntime.call(
            src,
            EntryPoint::VALIDATE,
            &[json!({})],
            &ScriptLimits::default(),
        );
        assert!(outcome.is_err());
    }

    #[test]
    fn test_runtime_error_is_captured() {
        let src = r#"fn validate(data) { throw "boom"; }"#;
        let err = RhaiRuntime
            .call(src, EntryPoint::VALIDATE, &[json!({})], &ScriptLimits::default())
            .unwrap_err();
        match err {
            ScriptError::Runtime(message) => assert!(message.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
