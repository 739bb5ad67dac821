//! Drives one job through OCR, LLM extraction and script validation.
//!
//! Every persisted change is a compare-and-set on the job's previous status,
//! so a terminal job can never be overwritten. Cancellation is checked before
//! each unit of work (page, provider call, retry, script); calls already in
//! flight are allowed to finish and their cost is kept.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::cancel::CancelSignal;
use super::context::{JobContext, ResolveError};
use super::model::{Job, JobErrorKind, JobKind, JobStatus, TransitionError};
use super::progress::{JobEvent, ProgressReporter};
use super::retry::RetryPolicy;
use crate::catalog::ExtractionStrategy;
use crate::config::Config;
use crate::cost::{estimate_tokens, Amount, CostAccountant, PricingMode, Stage, Usage};
use crate::dedup::ContentDeduplicator;
use crate::error::{PricingError, ProviderError, RepositoryError, ScriptError};
use crate::extraction::{
    field_schema, lookup_path, merge_field, parse_response, OutputValidator, Prompt,
    PromptBuilder, ReExtractState,
};
use crate::manifest::{ExtractionRecord, Manifest, OcrResult};
use crate::ports::{
    CatalogRepository, CompletionRequest, ExtractorPort, JobRepository, ManifestRepository,
    ModelPort, OcrPageRequest, ScriptRepository, StoragePort,
};
use crate::sanitize::{redact_path, truncate};
use crate::script::{ExportReport, ScriptEngine, ScriptKind, ValidationReport};

/// Persisted error messages are cut to this many characters.
pub(crate) const MAX_ERROR_CHARS: usize = 2_000;

const PROGRESS_STARTED: u8 = 5;
const PROGRESS_OCR_START: u8 = 10;
const PROGRESS_OCR_DONE: u8 = 40;
const PROGRESS_EXTRACTION_START: u8 = 45;
const PROGRESS_EXTRACTION_DONE: u8 = 80;
const PROGRESS_SCRIPTS_START: u8 = 85;
const PROGRESS_VALIDATION_DONE: u8 = 90;
const PROGRESS_SCRIPTS_DONE: u8 = 95;

/// Errors that prevent the machine from recording a job's outcome at all.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Job '{job_id}' is no longer in status {expected}")]
    Conflict { job_id: String, expected: JobStatus },
}

/// Tunables taken from the config file.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub retry: RetryPolicy,
    pub provider_timeout: Duration,
    pub max_reextract_attempts: u32,
    pub default_input_token_budget: u64,
    pub default_output_token_budget: u64,
    pub strategy: ExtractionStrategy,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MachineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.retry),
            provider_timeout: config.timeouts.provider(),
            max_reextract_attempts: config.extraction.max_reextract_attempts,
            default_input_token_budget: config.extraction.default_input_token_budget,
            default_output_token_budget: config.extraction.default_output_token_budget,
            strategy: config.extraction.strategy,
        }
    }
}

/// The collaborators a job needs, shared by every worker.
#[derive(Clone)]
pub struct JobServices {
    pub jobs: Arc<dyn JobRepository>,
    pub manifests: Arc<dyn ManifestRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub scripts: Arc<dyn ScriptRepository>,
    pub storage: Arc<dyn StoragePort>,
    pub extractor: Arc<dyn ExtractorPort>,
    pub model: Arc<dyn ModelPort>,
    pub script_engine: ScriptEngine,
    pub settings: MachineSettings,
}

impl JobServices {
    /// Wires every repository port to one store.
    pub fn new<S>(
        store: Arc<S>,
        storage: Arc<dyn StoragePort>,
        extractor: Arc<dyn ExtractorPort>,
        model: Arc<dyn ModelPort>,
        config: &Config,
    ) -> Self
    where
        S: JobRepository + ManifestRepository + CatalogRepository + ScriptRepository + 'static,
    {
        Self {
            jobs: store.clone(),
            manifests: store.clone(),
            catalog: store.clone(),
            scripts: store,
            storage,
            extractor,
            model,
            script_engine: ScriptEngine::rhai(config.scripts.limits()),
            settings: MachineSettings::from_config(config),
        }
    }
}

/// Why a job stopped before completing.
enum Interrupt {
    Cancel,
    Fail(JobErrorKind, String),
    Infra(MachineError),
}

impl From<MachineError> for Interrupt {
    fn from(e: MachineError) -> Self {
        Interrupt::Infra(e)
    }
}

impl From<RepositoryError> for Interrupt {
    fn from(e: RepositoryError) -> Self {
        Interrupt::Infra(MachineError::Repository(e))
    }
}

impl From<TransitionError> for Interrupt {
    fn from(e: TransitionError) -> Self {
        Interrupt::Infra(MachineError::Transition(e))
    }
}

impl From<ResolveError> for Interrupt {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Configuration(message) => {
                Interrupt::Fail(JobErrorKind::Configuration, message)
            }
            ResolveError::Repository(e) => e.into(),
        }
    }
}

impl From<PricingError> for Interrupt {
    fn from(e: PricingError) -> Self {
        let kind = match e {
            PricingError::NoPricingData { .. } => JobErrorKind::NoPricingData,
            PricingError::OutOfOrder { .. } | PricingError::InvalidRate { .. } => {
                JobErrorKind::Configuration
            }
        };
        Interrupt::Fail(kind, e.to_string())
    }
}

fn prompt_size(prompt: &Prompt) -> u64 {
    estimate_tokens(&prompt.system) + estimate_tokens(&prompt.user)
}

fn schema_mismatch(attempts: u32, problems: &[String]) -> Interrupt {
    Interrupt::Fail(
        JobErrorKind::SchemaMismatch,
        format!(
            "output did not match the schema after {} attempt(s): {}",
            attempts,
            problems.join("; ")
        ),
    )
}

fn checkpoint(cancel: &CancelSignal) -> Result<(), Interrupt> {
    if cancel.is_requested() {
        Err(Interrupt::Cancel)
    } else {
        Ok(())
    }
}

fn band(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 {
        return end;
    }
    let span = u64::from(end.saturating_sub(start));
    start.saturating_add((span * done.min(total) / total) as u8)
}

pub struct JobStateMachine {
    services: JobServices,
    accountant: CostAccountant,
}

impl JobStateMachine {
    pub fn new(services: JobServices) -> Self {
        Self {
            services,
            accountant: CostAccountant::new(),
        }
    }

    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Runs `job` until it reaches a terminal state and returns the final
    /// record. An `Err` means the outcome could not be persisted.
    pub async fn run(
        &self,
        job: Job,
        cancel: Arc<CancelSignal>,
        progress: &dyn ProgressReporter,
    ) -> Result<Job, MachineError> {
        let span = info_span!(
            "job",
            job_id = %job.id,
            manifest_id = job.manifest_id,
            kind = job.kind.as_str()
        );
        self.drive(job, cancel, progress).instrument(span).await
    }

    async fn drive(
        &self,
        mut job: Job,
        cancel: Arc<CancelSignal>,
        progress: &dyn ProgressReporter,
    ) -> Result<Job, MachineError> {
        if job.status.is_terminal() {
            debug!(status = %job.status, "Job already terminal");
            return Ok(job);
        }

        match self.stages(&mut job, &cancel, progress).await {
            Ok(()) => Ok(job),
            Err(Interrupt::Cancel) => {
                self.finish_canceled(&mut job, &cancel, progress).await?;
                Ok(job)
            }
            Err(Interrupt::Fail(kind, message)) => {
                self.finish_failed(&mut job, kind, message, progress).await?;
                Ok(job)
            }
            Err(Interrupt::Infra(e)) => Err(e),
        }
    }

    async fn stages(
        &self,
        job: &mut Job,
        cancel: &CancelSignal,
        progress: &dyn ProgressReporter,
    ) -> Result<(), Interrupt> {
        checkpoint(cancel)?;

        let mut ctx = JobContext::resolve(
            job,
            self.services.manifests.as_ref(),
            self.services.catalog.as_ref(),
            self.services.settings.strategy,
        )
        .await?;

        job.start();
        job.model_id = Some(ctx.model.id.clone());
        job.advance_progress(PROGRESS_STARTED);
        self.save(job).await?;
        progress.report(JobEvent::from_job(job, "Started"));
        info!(
            file = %redact_path(&ctx.manifest.storage_path),
            model = %ctx.model.id,
            strategy = ?ctx.strategy,
            "Job started"
        );

        if job.kind == JobKind::Extraction && self.deduplicate(job, &mut ctx, progress).await? {
            return Ok(());
        }

        // LLM rates are needed for the first estimate, before any OCR work.
        let llm_rates = self.accountant.rates(
            &ctx.model.id,
            &ctx.model.pricing,
            PricingMode::Token,
            Utc::now(),
        )?;
        let planned = Usage::tokens(
            self.services.settings.default_input_token_budget,
            self.services.settings.default_output_token_budget,
        );
        let estimate = self.accountant.actualize(planned, &llm_rates);
        self.accountant
            .apply(&mut job.estimated_cost, Stage::Llm, estimate);
        ctx.llm_rates = Some(llm_rates);

        checkpoint(cancel)?;
        self.advance(job, JobStatus::OcrRunning, PROGRESS_OCR_START, "Running OCR", progress)
            .await?;

        self.ocr_stage(job, &mut ctx, cancel, progress)
            .instrument(info_span!("stage", name = "ocr"))
            .await?;

        self.advance(job, JobStatus::OcrDone, PROGRESS_OCR_DONE, "OCR finished", progress)
            .await?;

        checkpoint(cancel)?;
        self.advance(
            job,
            JobStatus::ExtractionRunning,
            PROGRESS_EXTRACTION_START,
            "Extracting data",
            progress,
        )
        .await?;

        let data = self
            .extraction_stage(job, &mut ctx, cancel, progress)
            .instrument(info_span!("stage", name = "extraction"))
            .await?;

        self.services
            .manifests
            .save_extraction(
                ctx.manifest.id,
                &ExtractionRecord {
                    data: data.clone(),
                    cost: job.actual_cost.total(),
                    currency: job.actual_cost.currency().map(str::to_string),
                },
            )
            .await?;

        checkpoint(cancel)?;
        self.advance(
            job,
            JobStatus::ValidationRunning,
            PROGRESS_SCRIPTS_START,
            "Running scripts",
            progress,
        )
        .await?;

        self.script_stage(job, &ctx, &data, cancel, progress)
            .instrument(info_span!("stage", name = "scripts"))
            .await?;

        self.advance(job, JobStatus::Completed, 100, "Completed", progress)
            .await?;
        info!(
            total_cost = %job.actual_cost.total(),
            pages = job.pages_processed,
            input_tokens = job.llm_input_tokens,
            output_tokens = job.llm_output_tokens,
            "Job completed"
        );
        Ok(())
    }

    /// Fingerprints a manifest that has no digest yet. When the group already
    /// holds the same content with an OCR result, that result is reused and
    /// the job completes without any provider call.
    async fn deduplicate(
        &self,
        job: &mut Job,
        ctx: &mut JobContext,
        progress: &dyn ProgressReporter,
    ) -> Result<bool, Interrupt> {
        if ctx.manifest.content_sha256.is_some() {
            return Ok(false);
        }

        let document = ctx
            .document(self.services.storage.as_ref())
            .await
            .map_err(|e| Interrupt::Fail(JobErrorKind::Storage, e.to_string()))?;
        let digest = ContentDeduplicator::fingerprint(&document);
        let dedup = ContentDeduplicator::new(Arc::clone(&self.services.manifests));
        let group_id = ctx.manifest.group_id;

        let existing = dedup
            .is_duplicate(group_id, &digest)
            .await?
            .filter(|m| m.id != ctx.manifest.id);
        let original = match existing {
            Some(original) => Some(original),
            None => {
                let claimed = self
                    .services
                    .manifests
                    .set_content_hash(ctx.manifest.id, digest.as_str())
                    .await;
                match claimed {
                    Ok(()) => {
                        ctx.manifest.content_sha256 = Some(digest.to_string());
                        None
                    }
                    // Another manifest claimed the digest between lookup and write.
                    Err(RepositoryError::DuplicateContent { .. }) => dedup
                        .is_duplicate(group_id, &digest)
                        .await?
                        .filter(|m| m.id != ctx.manifest.id),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let Some(original) = original else {
            return Ok(false);
        };
        let Some(ocr) = original.ocr_result.clone() else {
            debug!(original = original.id, "Duplicate content has no OCR result yet");
            return Ok(false);
        };

        self.reuse_duplicate(&ctx.manifest, &original, &ocr).await?;
        job.pages_processed = 0;
        self.advance(
            job,
            JobStatus::Completed,
            100,
            "Duplicate content, reused existing results",
            progress,
        )
        .await?;
        info!(original_manifest = original.id, "Job completed from duplicate content");
        Ok(true)
    }

    async fn reuse_duplicate(
        &self,
        manifest: &Manifest,
        original: &Manifest,
        ocr: &OcrResult,
    ) -> Result<(), RepositoryError> {
        let page_count = original
            .page_count
            .unwrap_or(ocr.pages.len() as u32);
        self.services
            .manifests
            .save_ocr_result(manifest.id, ocr, page_count, Utc::now())
            .await?;
        if let Some(data) = &original.extracted_data {
            self.services
                .manifests
                .save_extraction(
                    manifest.id,
                    &ExtractionRecord {
                        data: data.clone(),
                        cost: Amount::ZERO,
                        currency: None,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn ocr_stage(
        &self,
        job: &mut Job,
        ctx: &mut JobContext,
        cancel: &CancelSignal,
        progress: &dyn ProgressReporter,
    ) -> Result<(), Interrupt> {
        if ctx.strategy == ExtractionStrategy::ReuseOcr {
            if let Some(stored) = &ctx.manifest.ocr_result {
                info!(chars = stored.text.len(), "Reusing stored OCR result");
                ctx.ocr_text = Some(stored.text.clone());
                return Ok(());
            }
        }

        let extractor = ctx.extractor()?.clone();
        let document = ctx
            .document(self.services.storage.as_ref())
            .await
            .map_err(|e| Interrupt::Fail(JobErrorKind::Storage, e.to_string()))?;
        let file_type = ctx.manifest.file_type.clone();
        let mode = extractor.pricing_mode();

        let ocr_rates =
            self.accountant
                .rates(&extractor.id, &extractor.pricing, mode, Utc::now())?;

        let port = Arc::clone(&self.services.extractor);
        let page_count = self
            .call_provider(job, cancel, "count_pages", || {
                port.count_pages(&extractor, &document, &file_type)
            })
            .await?;
        if page_count == 0 {
            return Err(Interrupt::Fail(
                JobErrorKind::Provider,
                "extractor reported a document without pages".to_string(),
            ));
        }

        let planned = match mode {
            PricingMode::Page => Usage::pages(page_count),
            PricingMode::Token => Usage::tokens(
                self.services.settings.default_input_token_budget * u64::from(page_count),
                self.services.settings.default_output_token_budget * u64::from(page_count),
            ),
        };
        let estimate = self.accountant.actualize(planned, &ocr_rates);
        self.accountant
            .apply(&mut job.estimated_cost, Stage::Ocr, estimate);
        self.save(job).await?;
        debug!(pages = page_count, extractor = %extractor.id, "Starting OCR");

        let mut pages = Vec::with_capacity(page_count as usize);
        let mut scores = Vec::new();
        for page_index in 0..page_count {
            checkpoint(cancel)?;

            let request = OcrPageRequest {
                extractor: &extractor,
                document: &document,
                file_type: &file_type,
                page_index,
                page_count,
            };
            let output = self
                .call_provider(job, cancel, "extract_page", || port.extract_page(request))
                .await?;

            let usage = if !output.usage.is_empty() {
                output.usage
            } else {
                match mode {
                    PricingMode::Page => Usage::pages(1),
                    PricingMode::Token => Usage::tokens(0, estimate_tokens(&output.text)),
                }
            };
            ctx.ocr_usage += usage;

            let cost = self.accountant.actualize(ctx.ocr_usage, &ocr_rates);
            self.accountant.apply(&mut job.actual_cost, Stage::Ocr, cost);
            job.pages_processed = page_index + 1;
            job.advance_progress(band(
                PROGRESS_OCR_START,
                PROGRESS_OCR_DONE,
                u64::from(page_index + 1),
                u64::from(page_count),
            ));
            self.save(job).await?;
            progress.report(JobEvent::from_job(
                job,
                format!("OCR page {} of {}", page_index + 1, page_count),
            ));

            if let Some(score) = output.quality_score {
                scores.push(score);
            }
            pages.push(output.text);
        }

        let result = OcrResult::from_pages(&extractor.id, pages, &scores);
        self.services
            .manifests
            .save_ocr_result(ctx.manifest.id, &result, page_count, Utc::now())
            .await?;
        ctx.ocr_text = Some(result.text.clone());
        ctx.manifest.ocr_result = Some(result);
        ctx.manifest.page_count = Some(page_count);
        ctx.ocr_rates = Some(ocr_rates);

        info!(
            pages = page_count,
            ocr_cost = %job.actual_cost.ocr,
            "OCR finished"
        );
        Ok(())
    }

    async fn extraction_stage(
        &self,
        job: &mut Job,
        ctx: &mut JobContext,
        cancel: &CancelSignal,
        progress: &dyn ProgressReporter,
    ) -> Result<Value, Interrupt> {
        let llm_rates = match ctx.llm_rates.clone() {
            Some(rates) => rates,
            None => self.accountant.rates(
                &ctx.model.id,
                &ctx.model.pricing,
                PricingMode::Token,
                Utc::now(),
            )?,
        };
        let text = ctx.ocr_text.clone().unwrap_or_default();
        let schema = ctx.project.json_schema.clone();
        let field = match job.kind {
            JobKind::Extraction => None,
            JobKind::FieldReExtraction => Some(job.field_name.clone().ok_or_else(|| {
                Interrupt::Fail(
                    JobErrorKind::Configuration,
                    "field re-extraction job without a field name".to_string(),
                )
            })?),
        };

        let empty_schema = json!({});
        let target_schema = match &field {
            Some(f) => field_schema(&schema, f).unwrap_or(&empty_schema),
            None => &schema,
        };
        let validator = OutputValidator::new(target_schema).map_err(|e| {
            Interrupt::Fail(
                JobErrorKind::Configuration,
                format!("project JSON schema is invalid: {}", e),
            )
        })?;

        let previous_data = ctx.manifest.extracted_data.clone();
        let builder = PromptBuilder::new(ctx.project.system_prompt.as_deref(), &schema, &text);
        let mut state = ReExtractState::new(self.services.settings.max_reextract_attempts);
        let output_budget = self.services.settings.default_output_token_budget;
        let port = Arc::clone(&self.services.model);

        while state.begin_attempt() {
            checkpoint(cancel)?;

            let build = |builder: PromptBuilder<'_>| match &field {
                Some(f) => builder.field(f, previous_data.as_ref(), &state),
                None => builder.document(&state),
            };
            let window = ctx.model.context_window_tokens;
            let mut prompt = build(builder);
            let mut prompt_tokens = prompt_size(&prompt);
            if prompt_tokens > window && state.is_retry() {
                debug!(
                    attempt = state.attempt(),
                    prompt_tokens, "Retry prompt too large, leaving out the previous answer"
                );
                prompt = build(builder.without_previous_answer());
                prompt_tokens = prompt_size(&prompt);
            }
            if prompt_tokens > window {
                if state.is_retry() {
                    warn!(
                        attempt = state.attempt(),
                        prompt_tokens, "No room left for another attempt"
                    );
                    return Err(schema_mismatch(state.attempt() - 1, state.feedback()));
                }
                return Err(Interrupt::Fail(
                    JobErrorKind::OcrContextTooLarge,
                    format!(
                        "prompt needs about {} tokens but model '{}' accepts {}",
                        prompt_tokens, ctx.model.id, window
                    ),
                ));
            }

            if !state.is_retry() {
                let estimate = self
                    .accountant
                    .actualize(Usage::tokens(prompt_tokens, output_budget), &llm_rates);
                self.accountant
                    .apply(&mut job.estimated_cost, Stage::Llm, estimate);
            }
            job.system_prompt = Some(prompt.system.clone());
            job.user_prompt = Some(prompt.user.clone());
            job.assistant_response = None;
            self.save(job).await?;

            let request = CompletionRequest {
                model: &ctx.model,
                system_prompt: &prompt.system,
                user_prompt: &prompt.user,
                json_schema: target_schema,
                max_output_tokens: output_budget,
            };
            let completion = match self
                .call_provider(job, cancel, "complete", || port.complete(request))
                .await
            {
                Ok(completion) => completion,
                Err(Interrupt::Fail(JobErrorKind::OcrContextTooLarge, message)) if state.is_retry() => {
                    warn!(
                        attempt = state.attempt(),
                        error = %message,
                        "Model rejected the retry prompt as too long"
                    );
                    return Err(schema_mismatch(state.attempt() - 1, state.feedback()));
                }
                Err(e) => return Err(e),
            };

            let usage = completion.usage.unwrap_or_else(|| {
                Usage::tokens(prompt_tokens, estimate_tokens(&completion.content))
            });
            ctx.llm_usage += usage;
            job.llm_input_tokens = ctx.llm_usage.input_tokens;
            job.llm_output_tokens = ctx.llm_usage.output_tokens;
            let cost = self.accountant.actualize(ctx.llm_usage, &llm_rates);
            self.accountant.apply(&mut job.actual_cost, Stage::Llm, cost);
            job.assistant_response = Some(completion.content.clone());
            job.advance_progress(band(
                PROGRESS_EXTRACTION_START,
                PROGRESS_EXTRACTION_DONE,
                u64::from(state.attempt()),
                u64::from(state.max_attempts()),
            ));
            self.save(job).await?;

            let parsed = match parse_response(&completion.content) {
                Ok(value) => value,
                Err(problem) => {
                    warn!(attempt = state.attempt(), "Model response is not usable JSON");
                    state.record_failure(completion.content, vec![problem]);
                    continue;
                }
            };

            let (candidate, checked) = match &field {
                None => (parsed.clone(), parsed),
                Some(f) => {
                    let value = parsed
                        .get(f.as_str())
                        .or_else(|| lookup_path(&parsed, f))
                        .cloned();
                    let Some(value) = value else {
                        state.record_failure(
                            completion.content,
                            vec![format!("The response must contain the key \"{}\".", f)],
                        );
                        continue;
                    };
                    (merge_field(previous_data.clone(), f, value.clone()), value)
                }
            };

            let problems = validator.diagnostics(&checked);
            if problems.is_empty() {
                job.advance_progress(PROGRESS_EXTRACTION_DONE);
                progress.report(JobEvent::from_job(job, "Extraction finished"));
                info!(
                    attempts = state.attempt(),
                    llm_cost = %job.actual_cost.llm,
                    "Extraction finished"
                );
                return Ok(candidate);
            }

            warn!(
                attempt = state.attempt(),
                problems = problems.len(),
                "Extraction output does not match the schema"
            );
            progress.report(JobEvent::from_job(
                job,
                format!(
                    "Output rejected, attempt {} of {}",
                    state.attempt(),
                    state.max_attempts()
                ),
            ));
            state.record_failure(completion.content, problems);
        }

        Err(schema_mismatch(state.attempt(), state.feedback()))
    }

    async fn script_stage(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        data: &Value,
        cancel: &CancelSignal,
        progress: &dyn ProgressReporter,
    ) -> Result<(), Interrupt> {
        let engine = &self.services.script_engine;
        let validation_scripts = self
            .services
            .scripts
            .validation_scripts(ctx.project.id)
            .await?;
        let export_scripts = self.services.scripts.export_scripts(ctx.project.id).await?;

        let syntax = validation_scripts
            .iter()
            .map(|s| (&s.name, &s.script, ScriptKind::Validation))
            .chain(
                export_scripts
                    .iter()
                    .map(|s| (&s.name, &s.script, ScriptKind::Export)),
            );
        for (name, source, kind) in syntax {
            if let Err(e) = engine.validate_syntax(source, kind) {
                let kind = match e {
                    ScriptError::Syntax { .. } | ScriptError::MissingEntryPoint { .. } => {
                        JobErrorKind::ScriptSyntax
                    }
                    _ => JobErrorKind::Internal,
                };
                return Err(Interrupt::Fail(kind, format!("script '{}': {}", name, e)));
            }
        }

        let mut report = ValidationReport::default();
        for script in &validation_scripts {
            checkpoint(cancel)?;
            let outcomes = engine.run_validation(script, data).await;
            report.extend(outcomes);
        }
        if !validation_scripts.is_empty() {
            self.services
                .manifests
                .save_validation_results(ctx.manifest.id, &report)
                .await?;
        }
        if report.has_blocking() {
            return Err(Interrupt::Fail(
                JobErrorKind::ValidationFailed,
                report.blocking_summary(),
            ));
        }

        job.advance_progress(PROGRESS_VALIDATION_DONE);
        self.save(job).await?;
        progress.report(JobEvent::from_job(job, "Validation finished"));

        let export_context = json!({
            "jobId": job.id,
            "manifestId": ctx.manifest.id,
            "projectId": ctx.project.id,
            "filename": ctx.manifest.filename,
            "fileType": ctx.manifest.file_type,
        });
        let mut exports = ExportReport::default();
        for script in &export_scripts {
            checkpoint(cancel)?;
            exports.push(engine.run_export(script, data, &export_context).await);
            self.services
                .manifests
                .save_export_outputs(ctx.manifest.id, &exports)
                .await?;
        }

        if !exports.failures.is_empty() {
            warn!(failed = exports.failures.len(), "Some export scripts failed");
        }
        job.advance_progress(PROGRESS_SCRIPTS_DONE);
        self.save(job).await?;
        Ok(())
    }

    /// Calls a provider with a hard timeout, retrying transient failures
    /// with exponential backoff. Cancellation is checked before each retry.
    async fn call_provider<T, F, Fut>(
        &self,
        job: &mut Job,
        cancel: &CancelSignal,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        T: Send,
    {
        let policy = self.services.settings.retry;
        let limit = self.services.settings.provider_timeout;
        let mut attempt = 1u32;

        loop {
            let result = match tokio::time::timeout(limit, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    after_ms: limit.as_millis() as u64,
                }),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let ProviderError::ContextLengthExceeded(_) = err {
                return Err(Interrupt::Fail(
                    JobErrorKind::OcrContextTooLarge,
                    err.to_string(),
                ));
            }

            if !err.is_retryable() {
                return Err(Interrupt::Fail(
                    JobErrorKind::Provider,
                    format!("{} failed: {}", operation, err),
                ));
            }

            if !policy.allows_retry_after(attempt) {
                return Err(Interrupt::Fail(
                    JobErrorKind::Transient,
                    format!("{} failed after {} attempt(s): {}", operation, attempt, err),
                ));
            }

            let delay = policy.delay_for(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Provider call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            checkpoint(cancel)?;

            attempt += 1;
            job.attempt_count = job.attempt_count.saturating_add(1);
            self.save(job).await?;
        }
    }

    async fn finish_canceled(
        &self,
        job: &mut Job,
        cancel: &CancelSignal,
        progress: &dyn ProgressReporter,
    ) -> Result<(), MachineError> {
        let now = Utc::now();
        let (requested_at, reason) = match cancel.get() {
            Some(request) => (request.requested_at, request.reason.clone()),
            None => (now, None),
        };
        if job.cancel_requested_at.is_none() {
            job.cancel_requested_at = Some(requested_at);
        }
        if job.cancel_reason.is_none() {
            job.cancel_reason = reason;
        }

        let current = job.progress;
        if job.status != JobStatus::CancelRequested {
            self.advance(
                job,
                JobStatus::CancelRequested,
                current,
                "Cancellation requested",
                progress,
            )
            .await?;
        }
        self.advance(job, JobStatus::Canceled, current, "Canceled", progress)
            .await?;

        info!(
            pages = job.pages_processed,
            cost = %job.actual_cost.total(),
            "Job canceled"
        );
        Ok(())
    }

    async fn finish_failed(
        &self,
        job: &mut Job,
        kind: JobErrorKind,
        message: String,
        progress: &dyn ProgressReporter,
    ) -> Result<(), MachineError> {
        let message = truncate(&message, MAX_ERROR_CHARS);
        error!(error_kind = kind.as_str(), error = %message, "Job failed");

        let from = job.fail(kind, message)?;
        self.write(job, from).await?;
        progress.report(JobEvent::from_job(job, "Failed"));
        Ok(())
    }

    async fn advance(
        &self,
        job: &mut Job,
        next: JobStatus,
        progress_value: u8,
        message: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<(), MachineError> {
        let from = job.transition(next)?;
        job.advance_progress(progress_value);
        self.write(job, from).await?;
        debug!(from = %from, to = %next, "Job transitioned");
        progress.report(JobEvent::from_job(job, message));
        Ok(())
    }

    async fn save(&self, job: &mut Job) -> Result<(), MachineError> {
        job.touch();
        let expected = job.status;
        self.write(job, expected).await
    }

    async fn write(&self, job: &Job, expected: JobStatus) -> Result<(), MachineError> {
        if self.services.jobs.update_if_status(job, expected).await? {
            Ok(())
        } else {
            Err(MachineError::Conflict {
                job_id: job.id.clone(),
                expected,
            })
        }
    }
}
