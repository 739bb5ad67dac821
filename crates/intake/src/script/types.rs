use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a validation rule. `Error` outcomes block the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    #[default]
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Function a script must define, with its parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: &'static str,
    pub arity: usize,
}

impl EntryPoint {
    pub const VALIDATE: EntryPoint = EntryPoint {
        name: "validate",
        arity: 1,
    };
    pub const EXPORT_ROWS: EntryPoint = EntryPoint {
        name: "export_rows",
        arity: 2,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Validation,
    Export,
}

impl ScriptKind {
    pub fn entry_point(self) -> EntryPoint {
        match self {
            ScriptKind::Validation => EntryPoint::VALIDATE,
            ScriptKind::Export => EntryPoint::EXPORT_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationScript {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub severity: Severity,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportScript {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewValidationScript {
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub severity: Severity,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExportScript {
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub priority: i32,
    pub enabled: bool,
}

/// Result of one rule reported by a validation script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub script_id: i64,
    pub script_name: String,
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub passed: bool,
    pub message: String,
    pub severity: Severity,
}

impl RuleOutcome {
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub outcomes: Vec<RuleOutcome>,
}

impl ValidationReport {
    pub fn extend(&mut self, outcomes: Vec<RuleOutcome>) {
        self.outcomes.extend(outcomes);
    }

    pub fn has_blocking(&self) -> bool {
        self.outcomes.iter().any(RuleOutcome::is_blocking)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    /// One line per blocking failure, for the job error message.
    pub fn blocking_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter(|o| o.is_blocking())
            .map(|o| match &o.field {
                Some(field) => format!("{}: {} ({})", o.script_name, o.message, field),
                None => format!("{}: {}", o.script_name, o.message),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Rows produced by one export script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub script_id: i64,
    pub script_name: String,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFailure {
    pub script_id: i64,
    pub script_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub artifacts: Vec<ExportArtifact>,
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    pub fn push(&mut self, result: Result<ExportArtifact, ExportFailure>) {
        match result {
            Ok(artifact) => self.artifacts.push(artifact),
            Err(failure) => self.failures.push(failure),
        }
    }
}
