//! `SqliteStore`: the repository ports backed by the free-function
//! repositories in this module.
//!
//! Calls run inline on the async task. Each one holds the connection lock
//! for a single short statement or transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::catalog_repo::{self, PricingOwner};
use super::{job_repo, manifest_repo, script_repo, stats_repo, Database, DatabaseError};
use crate::catalog::{Extractor, LlmModel, Project};
use crate::cost::PricingEntry;
use crate::error::RepositoryError;
use crate::job::{Job, JobStats, JobStatus};
use crate::manifest::{ExtractionRecord, Manifest, NewManifest, OcrResult};
use crate::ports::{CatalogRepository, JobRepository, ManifestRepository, ScriptRepository};
use crate::script::{
    ExportReport, ExportScript, NewExportScript, NewValidationScript, ValidationReport,
    ValidationScript,
};

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn duplicate_or(err: DatabaseError, group_id: i64, content_sha256: &str) -> RepositoryError {
    match err {
        DatabaseError::UniqueViolation(_) => RepositoryError::DuplicateContent {
            group_id,
            content_sha256: content_sha256.to_string(),
        },
        other => RepositoryError::Database(other),
    }
}

#[async_trait]
impl JobRepository for SqliteStore {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError> {
        job_repo::insert(&self.db, &job.into())?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Job>, RepositoryError> {
        Ok(job_repo::find_by_id(&self.db, id)?
            .map(Job::try_from)
            .transpose()?)
    }

    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> Result<bool, RepositoryError> {
        let written = job_repo::update_if_status(&self.db, &job.into(), expected.as_str())?;
        if !written {
            log::debug!(
                "Job {} not written: stored status is no longer {}",
                job.id,
                expected
            );
        }
        Ok(written)
    }

    async fn record_cancel_request(
        &self,
        id: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(job_repo::record_cancel_request(&self.db, id, reason, &at)?)
    }

    async fn history(&self, manifest_id: Option<i64>, limit: usize) -> Result<Vec<Job>, RepositoryError> {
        let rows = job_repo::history(&self.db, manifest_id, limit as u64)?;
        Ok(rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count_by_status(&self) -> Result<JobStats, RepositoryError> {
        let mut counts = Vec::new();
        for (status, count) in stats_repo::count_by_status(&self.db)? {
            match status.parse::<JobStatus>() {
                Ok(status) => counts.push((status, count)),
                Err(reason) => {
                    return Err(DatabaseError::Decode {
                        column: "status",
                        reason,
                    }
                    .into())
                }
            }
        }
        Ok(JobStats::from_counts(counts))
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, RepositoryError> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        Ok(job_repo::list_by_status(&self.db, &names)?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl ManifestRepository for SqliteStore {
    async fn find(&self, id: i64) -> Result<Option<Manifest>, RepositoryError> {
        Ok(manifest_repo::find_by_id(&self.db, id)?
            .map(manifest_repo::decode)
            .transpose()?)
    }

    async fn find_by_content_hash(
        &self,
        group_id: i64,
        content_sha256: &str,
    ) -> Result<Option<Manifest>, RepositoryError> {
        Ok(manifest_repo::find_by_content_hash(&self.db, group_id, content_sha256)?
            .map(manifest_repo::decode)
            .transpose()?)
    }

    async fn insert(&self, manifest: &NewManifest) -> Result<Manifest, RepositoryError> {
        let id = manifest_repo::insert(&self.db, manifest, &Utc::now()).map_err(|e| {
            duplicate_or(
                e,
                manifest.group_id,
                manifest.content_sha256.as_deref().unwrap_or_default(),
            )
        })?;
        let row = manifest_repo::find_by_id(&self.db, id)?.ok_or_else(|| RepositoryError::NotFound {
            entity: "Manifest",
            id: id.to_string(),
        })?;
        Ok(manifest_repo::decode(row)?)
    }

    async fn set_content_hash(&self, id: i64, content_sha256: &str) -> Result<(), RepositoryError> {
        match manifest_repo::set_content_hash(&self.db, id, content_sha256) {
            Ok(()) => Ok(()),
            Err(e @ DatabaseError::UniqueViolation(_)) => {
                let group_id = manifest_repo::find_by_id(&self.db, id)?
                    .map(|row| row.group_id)
                    .ok_or_else(|| RepositoryError::NotFound {
                        entity: "Manifest",
                        id: id.to_string(),
                    })?;
                Err(duplicate_or(e, group_id, content_sha256))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_ocr_result(
        &self,
        id: i64,
        result: &OcrResult,
        page_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        manifest_repo::save_ocr_result(&self.db, id, result, page_count, &processed_at)?;
        Ok(())
    }

    async fn save_extraction(&self, id: i64, record: &ExtractionRecord) -> Result<(), RepositoryError> {
        manifest_repo::save_extraction(&self.db, id, record)?;
        Ok(())
    }

    async fn save_validation_results(
        &self,
        id: i64,
        report: &ValidationReport,
    ) -> Result<(), RepositoryError> {
        manifest_repo::save_validation_results(&self.db, id, report)?;
        Ok(())
    }

    async fn save_export_outputs(&self, id: i64, report: &ExportReport) -> Result<(), RepositoryError> {
        manifest_repo::save_export_outputs(&self.db, id, report)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for SqliteStore {
    async fn find_project(&self, id: i64) -> Result<Option<Project>, RepositoryError> {
        Ok(catalog_repo::find_project(&self.db, id)?
            .map(Project::try_from)
            .transpose()?)
    }

    async fn insert_project(&self, project: &Project) -> Result<(), RepositoryError> {
        catalog_repo::insert_project(&self.db, project)?;
        Ok(())
    }

    async fn find_extractor(&self, id: &str) -> Result<Option<Extractor>, RepositoryError> {
        Ok(catalog_repo::find_extractor(&self.db, id)?
            .map(Extractor::try_from)
            .transpose()?)
    }

    async fn default_extractor(&self) -> Result<Option<Extractor>, RepositoryError> {
        Ok(catalog_repo::default_extractor(&self.db)?
            .map(Extractor::try_from)
            .transpose()?)
    }

    async fn upsert_extractor(&self, extractor: &Extractor) -> Result<(), RepositoryError> {
        catalog_repo::upsert_extractor(&self.db, extractor)?;
        Ok(())
    }

    async fn find_model(&self, id: &str) -> Result<Option<LlmModel>, RepositoryError> {
        Ok(catalog_repo::find_model(&self.db, id)?
            .map(LlmModel::try_from)
            .transpose()?)
    }

    async fn upsert_model(&self, model: &LlmModel) -> Result<(), RepositoryError> {
        catalog_repo::upsert_model(&self.db, model)?;
        Ok(())
    }

    async fn append_model_pricing(&self, model_id: &str, entry: PricingEntry) -> Result<(), RepositoryError> {
        catalog_repo::append_pricing(&self.db, PricingOwner::Model, model_id, entry)
    }

    async fn append_extractor_pricing(
        &self,
        extractor_id: &str,
        entry: PricingEntry,
    ) -> Result<(), RepositoryError> {
        catalog_repo::append_pricing(&self.db, PricingOwner::Extractor, extractor_id, entry)
    }
}

#[async_trait]
impl ScriptRepository for SqliteStore {
    async fn insert_validation_script(
        &self,
        script: &NewValidationScript,
    ) -> Result<ValidationScript, RepositoryError> {
        let created_at = Utc::now();
        let id = script_repo::insert_validation(&self.db, script, &created_at)?;
        Ok(ValidationScript {
            id,
            project_id: script.project_id,
            name: script.name.clone(),
            script: script.script.clone(),
            severity: script.severity,
            enabled: script.enabled,
            created_at,
        })
    }

    async fn insert_export_script(&self, script: &NewExportScript) -> Result<ExportScript, RepositoryError> {
        let created_at = Utc::now();
        let id = script_repo::insert_export(&self.db, script, &created_at)?;
        Ok(ExportScript {
            id,
            project_id: script.project_id,
            name: script.name.clone(),
            script: script.script.clone(),
            priority: script.priority,
            enabled: script.enabled,
            created_at,
        })
    }

    async fn validation_scripts(&self, project_id: i64) -> Result<Vec<ValidationScript>, RepositoryError> {
        Ok(script_repo::enabled_validation(&self.db, project_id)?
            .into_iter()
            .map(ValidationScript::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn export_scripts(&self, project_id: i64) -> Result<Vec<ExportScript>, RepositoryError> {
        Ok(script_repo::enabled_export(&self.db, project_id)?
            .into_iter()
            .map(ExportScript::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
