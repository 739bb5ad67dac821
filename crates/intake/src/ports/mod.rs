//! Boundaries to the collaborators the orchestrator does not own: file
//! storage, OCR and LLM providers, and persistence.
//!
//! Every port is an object-safe async trait so the state machine can hold
//! `Arc<dyn ...>` handles and tests can swap in fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::catalog::{Extractor, LlmModel, Project};
use crate::cost::{PricingEntry, Usage};
use crate::error::{ProviderError, RepositoryError, StorageError};
use crate::job::{Job, JobStats, JobStatus};
use crate::manifest::{ExtractionRecord, Manifest, NewManifest, OcrResult};
use crate::script::{
    ExportReport, ExportScript, NewExportScript, NewValidationScript, ValidationReport,
    ValidationScript,
};

/// Where an uploaded file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub storage_path: String,
    pub public_path: Option<String>,
    pub file_size: u64,
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn save_file(
        &self,
        group_id: i64,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError>;

    async fn read_file(&self, storage_path: &str) -> Result<Vec<u8>, StorageError>;
}

/// One page of OCR work.
#[derive(Debug, Clone, Copy)]
pub struct OcrPageRequest<'a> {
    pub extractor: &'a Extractor,
    pub document: &'a [u8],
    pub file_type: &'a str,
    /// Zero-based page index.
    pub page_index: u32,
    pub page_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrPageOutput {
    pub text: String,
    /// Units billed for this page: one page for page-priced extractors,
    /// tokens for vision-LLM extractors.
    pub usage: Usage,
    pub quality_score: Option<f64>,
}

#[async_trait]
pub trait ExtractorPort: Send + Sync {
    async fn count_pages(
        &self,
        extractor: &Extractor,
        document: &[u8],
        file_type: &str,
    ) -> Result<u32, ProviderError>;

    async fn extract_page(&self, request: OcrPageRequest<'_>) -> Result<OcrPageOutput, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a LlmModel,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub json_schema: &'a Value,
    pub max_output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Reported token usage; estimated from the text when absent.
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait ModelPort: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn find(&self, id: &str) -> Result<Option<Job>, RepositoryError>;

    /// Writes `job` only if the stored status still equals `expected`.
    /// Returns false when another writer got there first.
    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> Result<bool, RepositoryError>;

    /// Records a cancellation request on a non-terminal job without touching
    /// its status. Existing audit values are kept. Returns false when the job
    /// is already terminal or unknown.
    async fn record_cancel_request(
        &self,
        id: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Jobs newest first, optionally for one manifest.
    async fn history(&self, manifest_id: Option<i64>, limit: usize) -> Result<Vec<Job>, RepositoryError>;

    async fn count_by_status(&self) -> Result<JobStats, RepositoryError>;

    /// Jobs in any of `statuses`, oldest first.
    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, RepositoryError>;
}

#[async_trait]
pub trait ManifestRepository: Send + Sync {
    async fn find(&self, id: i64) -> Result<Option<Manifest>, RepositoryError>;

    async fn find_by_content_hash(
        &self,
        group_id: i64,
        content_sha256: &str,
    ) -> Result<Option<Manifest>, RepositoryError>;

    /// Fails with `RepositoryError::DuplicateContent` when the group already
    /// holds a manifest with the same digest.
    async fn insert(&self, manifest: &NewManifest) -> Result<Manifest, RepositoryError>;

    /// Same uniqueness rule as `insert`.
    async fn set_content_hash(&self, id: i64, content_sha256: &str) -> Result<(), RepositoryError>;

    async fn save_ocr_result(
        &self,
        id: i64,
        result: &OcrResult,
        page_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn save_extraction(&self, id: i64, record: &ExtractionRecord) -> Result<(), RepositoryError>;

    async fn save_validation_results(
        &self,
        id: i64,
        report: &ValidationReport,
    ) -> Result<(), RepositoryError>;

    async fn save_export_outputs(&self, id: i64, report: &ExportReport) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn find_project(&self, id: i64) -> Result<Option<Project>, RepositoryError>;

    async fn insert_project(&self, project: &Project) -> Result<(), RepositoryError>;

    async fn find_extractor(&self, id: &str) -> Result<Option<Extractor>, RepositoryError>;

    /// The active extractor flagged as default, if any.
    async fn default_extractor(&self) -> Result<Option<Extractor>, RepositoryError>;

    async fn upsert_extractor(&self, extractor: &Extractor) -> Result<(), RepositoryError>;

    async fn find_model(&self, id: &str) -> Result<Option<LlmModel>, RepositoryError>;

    async fn upsert_model(&self, model: &LlmModel) -> Result<(), RepositoryError>;

    /// Appends to a model's pricing history. Entries dated before the
    /// latest existing entry are rejected.
    async fn append_model_pricing(&self, model_id: &str, entry: PricingEntry) -> Result<(), RepositoryError>;

    async fn append_extractor_pricing(
        &self,
        extractor_id: &str,
        entry: PricingEntry,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ScriptRepository: Send + Sync {
    async fn insert_validation_script(
        &self,
        script: &NewValidationScript,
    ) -> Result<ValidationScript, RepositoryError>;

    async fn insert_export_script(&self, script: &NewExportScript) -> Result<ExportScript, RepositoryError>;

    /// Enabled validation scripts in creation order.
    async fn validation_scripts(&self, project_id: i64) -> Result<Vec<ValidationScript>, RepositoryError>;

    /// Enabled export scripts by ascending priority.
    async fn export_scripts(&self, project_id: i64) -> Result<Vec<ExportScript>, RepositoryError>;
}
