//! Everything a running job needs besides the job record itself.

use std::sync::Arc;

use crate::catalog::{ExtractionStrategy, Extractor, LlmModel, Project};
use crate::cost::{AppliedRates, Usage};
use crate::error::{RepositoryError, StorageError};
use crate::manifest::Manifest;
use crate::ports::{CatalogRepository, ManifestRepository, StoragePort};

use super::model::Job;

#[derive(Debug)]
pub enum ResolveError {
    /// A referenced record is missing or unusable.
    Configuration(String),
    Repository(RepositoryError),
}

impl From<RepositoryError> for ResolveError {
    fn from(e: RepositoryError) -> Self {
        ResolveError::Repository(e)
    }
}

pub struct JobContext {
    pub manifest: Manifest,
    pub project: Project,
    pub model: LlmModel,
    /// Only needed when OCR actually runs.
    pub extractor: Option<Extractor>,
    pub strategy: ExtractionStrategy,
    document: Option<Arc<[u8]>>,
    pub ocr_text: Option<String>,
    pub ocr_usage: Usage,
    pub llm_usage: Usage,
    pub ocr_rates: Option<AppliedRates>,
    pub llm_rates: Option<AppliedRates>,
}

impl JobContext {
    /// Loads the manifest, project, model and extractor for `job`.
    ///
    /// The extractor is taken from the manifest, then the project, then the
    /// global default.
    pub async fn resolve(
        job: &Job,
        manifests: &dyn ManifestRepository,
        catalog: &dyn CatalogRepository,
        default_strategy: ExtractionStrategy,
    ) -> Result<Self, ResolveError> {
        let manifest = manifests
            .find(job.manifest_id)
            .await?
            .ok_or_else(|| ResolveError::Configuration(format!("manifest {} not found", job.manifest_id)))?;

        let project = catalog
            .find_project(manifest.project_id)
            .await?
            .ok_or_else(|| {
                ResolveError::Configuration(format!("project {} not found", manifest.project_id))
            })?;

        let model_id = project.llm_model_id.as_deref().ok_or_else(|| {
            ResolveError::Configuration(format!("project {} has no LLM model", project.id))
        })?;
        let model = catalog
            .find_model(model_id)
            .await?
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                ResolveError::Configuration(format!("LLM model '{}' not found or inactive", model_id))
            })?;

        let extractor_id = manifest
            .text_extractor_id
            .as_deref()
            .or(project.text_extractor_id.as_deref());
        let extractor = match extractor_id {
            Some(id) => Some(
                catalog
                    .find_extractor(id)
                    .await?
                    .filter(|e| e.is_active)
                    .ok_or_else(|| {
                        ResolveError::Configuration(format!("extractor '{}' not found or inactive", id))
                    })?,
            ),
            None => catalog.default_extractor().await?,
        };

        let strategy = project.extraction_strategy.unwrap_or(default_strategy);

        Ok(Self {
            manifest,
            project,
            model,
            extractor,
            strategy,
            document: None,
            ocr_text: None,
            ocr_usage: Usage::default(),
            llm_usage: Usage::default(),
            ocr_rates: None,
            llm_rates: None,
        })
    }

    /// The document bytes, read from storage on first use.
    pub async fn document(&mut self, storage: &dyn StoragePort) -> Result<Arc<[u8]>, StorageError> {
        if let Some(doc) = &self.document {
            return Ok(Arc::clone(doc));
        }
        let bytes: Arc<[u8]> = storage.read_file(&self.manifest.storage_path).await?.into();
        self.document = Some(Arc::clone(&bytes));
        Ok(bytes)
    }

    pub fn extractor(&self) -> Result<&Extractor, ResolveError> {
        self.extractor.as_ref().ok_or_else(|| {
            ResolveError::Configuration(format!(
                "no text extractor configured for project {} and no default extractor",
                self.project.id
            ))
        })
    }
}
