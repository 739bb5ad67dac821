use std::path::PathBuf;
use thiserror::Error;

use crate::cost::UnitKind;
use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid extractor config ({extractor_type}): {reason}")]
    InvalidExtractor {
        extractor_type: String,
        reason: String,
    },
}

/// Errors surfaced by the repository ports.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Another manifest in the same group already carries this digest.
    #[error("Content {content_sha256} already exists in group {group_id}")]
    DuplicateContent {
        group_id: i64,
        content_sha256: String,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Stored file not found: {0}")]
    NotFound(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by OCR and LLM providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Provider network error: {0}")]
    Network(String),

    #[error("Provider rate limited: {0}")]
    RateLimited(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Input exceeds the model context window: {0}")]
    ContextLengthExceeded(String),

    #[error("Provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::Network(_)
                | ProviderError::RateLimited(_)
                | ProviderError::Unavailable(_)
        )
    }
}

/// Classifies a raw provider error message into a more specific variant.
pub fn classify_provider_message(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    let trimmed = message.trim().to_string();

    if lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
    {
        return ProviderError::ContextLengthExceeded(trimmed);
    }

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return ProviderError::RateLimited(trimmed);
    }

    if lower.contains("timed out") || lower.contains("timeout") {
        return ProviderError::Timeout { after_ms: 0 };
    }

    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("could not resolve host")
        || lower.contains("network is unreachable")
        || lower.contains("broken pipe")
    {
        return ProviderError::Network(trimmed);
    }

    if lower.contains("503")
        || lower.contains("502")
        || lower.contains("service unavailable")
        || lower.contains("overloaded")
    {
        return ProviderError::Unavailable(trimmed);
    }

    ProviderError::Rejected(trimmed)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// No history entry and no current pricing covers the requested unit.
    #[error("No pricing data for '{owner_id}' ({unit})")]
    NoPricingData { owner_id: String, unit: UnitKind },

    #[error("Pricing history for '{owner_id}' must be ordered by effective date: {reason}")]
    OutOfOrder { owner_id: String, reason: String },

    #[error("Invalid rate for '{owner_id}' ({unit}): {reason}")]
    InvalidRate {
        owner_id: String,
        unit: UnitKind,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script syntax error{}: {message}", .line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    Syntax {
        message: String,
        line: Option<usize>,
    },

    #[error("Script must define fn {name}() with {arity} parameter(s)")]
    MissingEntryPoint { name: &'static str, arity: usize },

    #[error("Script runtime error: {0}")]
    Runtime(String),

    #[error("Script exceeded its {limit_ms}ms time limit")]
    Timeout { limit_ms: u64 },

    #[error("Script exceeded its operation budget")]
    OperationLimit,

    #[error("Script returned an invalid result: {0}")]
    InvalidResult(String),

    #[error("Failed to convert script data: {0}")]
    Conversion(String),

    #[error("Failed to persist script: {0}")]
    Persist(#[from] RepositoryError),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Manifest {0} not found")]
    ManifestNotFound(i64),

    #[error("Invalid job submission: {0}")]
    InvalidSubmission(String),

    #[error("Orchestrator is shutting down")]
    ShutDown,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type Result<T> = std::result::Result<T, IntakeError>;
