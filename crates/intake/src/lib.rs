pub mod catalog;
pub mod config;
pub mod cost;
pub mod db;
pub mod dedup;
pub mod error;
pub mod extraction;
pub mod ingest;
pub mod job;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod ports;
pub mod sanitize;
pub mod script;

pub use catalog::{ExtractionStrategy, Extractor, ExtractorConfig, LlmModel, Project};
pub use config::{load_config, Config};
pub use cost::{Amount, CostAccountant, JobCost, ModelPricing, PricingResolver};
pub use db::{default_database_path, Database, SqliteStore};
pub use dedup::{ContentDeduplicator, ContentDigest};
pub use error::{
    ConfigError, IntakeError, OrchestratorError, ProviderError, RepositoryError, Result,
    ScriptError, StorageError,
};
pub use ingest::{Ingestor, NewUpload, UploadOutcome};
pub use job::{Job, JobErrorKind, JobEvent, JobKind, JobServices, JobStateMachine, JobStatus};
pub use logging::init_tracing;
pub use manifest::Manifest;
pub use orchestrator::{CancelOutcome, Orchestrator};
pub use script::{ScriptEngine, ScriptRuntime};
