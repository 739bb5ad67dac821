//! Sandboxed user scripts: per-project validation rules and export
//! transforms.

pub mod engine;
pub mod rhai_runtime;
pub mod runtime;
pub mod types;

pub use engine::ScriptEngine;
pub use rhai_runtime::RhaiRuntime;
pub use runtime::{ScriptLimits, ScriptRuntime};
pub use types::{
    EntryPoint, ExportArtifact, ExportFailure, ExportReport, ExportScript, NewExportScript,
    NewValidationScript, RuleOutcome, ScriptKind, Severity, ValidationReport, ValidationScript,
};
