//! Test harness for end-to-end job execution.
//!
//! `TestHarness` wires an in-memory SQLite store and the scripted fakes into
//! `JobServices`. The catalog is seeded with:
//! - project 1 with an invoice schema
//! - LLM model `test-model` priced at 2.50 / 10.00 USD per million tokens
//! - default extractor `test-ocr` priced at 0.001 USD per page

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use intake::catalog::{ExtractionStrategy, Extractor, ExtractorConfig, LlmModel, Project};
use intake::cost::{LlmRate, ModelPricing, OcrRate, PricingMode, RateCard};
use intake::job::{CancelSignal, NoopProgress};
use intake::manifest::{Manifest, NewManifest};
use intake::ports::{CatalogRepository, JobRepository, ManifestRepository, StoragePort};
use intake::{
    Config, Database, Ingestor, Job, JobKind, JobServices, JobStateMachine, NewUpload,
    Orchestrator, SqliteStore, UploadOutcome,
};

use super::fakes::{FlakyJobs, MemoryStorage, ScriptedExtractor, ScriptedModel};

pub const PROJECT_ID: i64 = 1;
pub const GROUP_ID: i64 = 1;
pub const MODEL_ID: &str = "test-model";
pub const EXTRACTOR_ID: &str = "test-ocr";
pub const DEFAULT_PAGES: usize = 10;
pub const VALID_REPLY: &str = r#"{"invoice_number": "INV-1", "total": 10.0}"#;

/// How long helpers wait for a job before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn invoice_schema() -> Value {
    json!({
        "type": "object",
        "required": ["invoice_number", "total"],
        "properties": {
            "invoice_number": { "type": "string" },
            "total": { "type": "number" }
        }
    })
}

/// Defaults with millisecond retries so failure paths stay fast.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.worker_count = 2;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.timeouts.provider_secs = 5;
    config.extraction.max_reextract_attempts = 2;
    config.extraction.strategy = ExtractionStrategy::ReuseOcr;
    config.scripts.timeout_ms = 2_000;
    config
}

pub fn test_model(context_window_tokens: u64) -> LlmModel {
    LlmModel {
        id: MODEL_ID.to_string(),
        name: "Test Model".to_string(),
        provider: "test".to_string(),
        context_window_tokens,
        pricing: ModelPricing::new(Some(RateCard {
            ocr: None,
            llm: Some(LlmRate {
                input_price: 2.5,
                output_price: 10.0,
                currency: "USD".to_string(),
                minimum_charge: None,
            }),
        })),
        is_active: true,
    }
}

pub fn test_extractor() -> Extractor {
    Extractor {
        id: EXTRACTOR_ID.to_string(),
        name: "Test OCR".to_string(),
        config: ExtractorConfig::PaddleOcr {
            endpoint: "http://ocr.test:8866".to_string(),
            languages: vec!["en".to_string()],
            use_angle_classifier: false,
            pricing_mode: PricingMode::Page,
        },
        pricing: ModelPricing::new(Some(RateCard {
            ocr: Some(OcrRate {
                price_per_page: 0.001,
                currency: "USD".to_string(),
                minimum_charge: None,
            }),
            llm: None,
        })),
        is_active: true,
        is_default: true,
    }
}

pub struct TestHarness {
    pub store: Arc<SqliteStore>,
    pub storage: Arc<MemoryStorage>,
    pub extractor: Arc<ScriptedExtractor>,
    pub model: Arc<ScriptedModel>,
    pub config: Config,
}

impl TestHarness {
    /// Seeded harness whose extractor returns ten pages and whose model
    /// answers with a valid invoice.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let store = Arc::new(SqliteStore::new(db));

        store
            .upsert_model(&test_model(128_000))
            .await
            .expect("Failed to seed model");
        store
            .upsert_extractor(&test_extractor())
            .await
            .expect("Failed to seed extractor");
        store
            .insert_project(&Project {
                id: PROJECT_ID,
                name: "Invoices".to_string(),
                llm_model_id: Some(MODEL_ID.to_string()),
                text_extractor_id: None,
                json_schema: invoice_schema(),
                system_prompt: None,
                extraction_strategy: None,
            })
            .await
            .expect("Failed to seed project");

        Self {
            store,
            storage: Arc::new(MemoryStorage::new()),
            extractor: Arc::new(ScriptedExtractor::with_pages(DEFAULT_PAGES)),
            model: Arc::new(ScriptedModel::answering(VALID_REPLY)),
            config,
        }
    }

    pub fn services(&self) -> JobServices {
        JobServices::new(
            Arc::clone(&self.store),
            self.storage.clone(),
            self.extractor.clone(),
            self.model.clone(),
            &self.config,
        )
    }

    pub fn machine(&self) -> JobStateMachine {
        JobStateMachine::new(self.services())
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.storage.clone(), self.store.clone())
    }

    pub async fn start(&self) -> Orchestrator {
        Orchestrator::start(self.services(), &self.config)
            .await
            .expect("Failed to start orchestrator")
    }

    /// Registers an upload in the default group and returns its manifest.
    /// Starts an orchestrator whose job repository fails on demand.
    pub async fn start_with_flaky_jobs(&self) -> (Orchestrator, Arc<FlakyJobs>) {
        let jobs = Arc::new(FlakyJobs::new(self.store.clone()));
        let mut services = self.services();
        services.jobs = jobs.clone();
        let orchestrator = Orchestrator::start(services, &self.config)
            .await
            .expect("Failed to start orchestrator");
        (orchestrator, jobs)
    }

    /// Polls the store directly until `job_id` satisfies `done`.
    pub async fn wait_for_job<F>(&self, job_id: &str, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let job = self.job(job_id).await;
            if done(&job) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {}",
                job_id,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Manifest {
        self.upload_to(GROUP_ID, filename, bytes).await.manifest().clone()
    }

    pub async fn upload_to(&self, group_id: i64, filename: &str, bytes: &[u8]) -> UploadOutcome {
        self.ingestor()
            .register_upload(NewUpload {
                group_id,
                project_id: PROJECT_ID,
                filename: filename.to_string(),
                bytes: bytes.to_vec(),
                file_type: None,
                text_extractor_id: None,
            })
            .await
            .expect("Failed to register upload")
    }

    /// Stores `bytes` and records a manifest without a content digest, the
    /// way rows imported from elsewhere look.
    pub async fn insert_unhashed_manifest(&self, filename: &str, bytes: &[u8]) -> Manifest {
        let stored = self
            .storage
            .save_file(GROUP_ID, filename, bytes)
            .await
            .expect("Failed to store file");
        ManifestRepository::insert(
            self.store.as_ref(),
            &NewManifest {
                group_id: GROUP_ID,
                project_id: PROJECT_ID,
                filename: filename.to_string(),
                storage_path: stored.storage_path,
                public_path: stored.public_path,
                file_type: "application/pdf".to_string(),
                file_size: stored.file_size,
                content_sha256: None,
                page_count: None,
                text_extractor_id: None,
            },
        )
        .await
        .expect("Failed to insert manifest")
    }

    pub async fn manifest(&self, id: i64) -> Manifest {
        ManifestRepository::find(self.store.as_ref(), id)
            .await
            .expect("Failed to load manifest")
            .expect("Manifest not found")
    }

    pub async fn job(&self, id: &str) -> Job {
        JobRepository::find(self.store.as_ref(), id)
            .await
            .expect("Failed to load job")
            .expect("Job not found")
    }

    /// Persists a new job and drives it to a terminal state on this task,
    /// without an orchestrator.
    pub async fn run_job(&self, manifest_id: i64, kind: JobKind, field_name: Option<&str>) -> Job {
        let job = Job::new(manifest_id, kind, field_name.map(str::to_string));
        JobRepository::insert(self.store.as_ref(), &job)
            .await
            .expect("Failed to insert job");
        self.machine()
            .run(job, Arc::new(CancelSignal::new()), &NoopProgress)
            .await
            .expect("Job outcome could not be persisted")
    }
}

/// Polls the orchestrator until `job_id` satisfies `done`.
pub async fn wait_until<F>(orchestrator: &Orchestrator, job_id: &str, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let job = orchestrator
            .job(job_id)
            .await
            .expect("Failed to load job")
            .expect("Job not found");
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} (progress {})",
            job_id,
            job.status,
            job.progress
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_terminal(orchestrator: &Orchestrator, job_id: &str) -> Job {
    wait_until(orchestrator, job_id, |job| job.status.is_terminal()).await
}

/// A small fake PDF; the content only matters for fingerprinting.
pub fn document(tag: &str) -> Vec<u8> {
    format!("%PDF-1.7\n% {}\n%%EOF\n", tag).into_bytes()
}
