//! In-memory stand-ins for the provider and storage ports.
//!
//! Each fake is scripted up front and counts its calls so tests can assert
//! on what the state machine actually asked for.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use intake::catalog::Extractor;
use intake::cost::Usage;
use intake::db::DatabaseError;
use intake::error::{ProviderError, RepositoryError, StorageError};
use intake::job::{JobStats, JobStatus};
use intake::ports::{
    Completion, CompletionRequest, ExtractorPort, JobRepository, ModelPort, OcrPageOutput,
    OcrPageRequest, StoragePort, StoredFile,
};
use intake::Job;

/// Keeps uploaded files in a map keyed by storage path.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn save_file(
        &self,
        group_id: i64,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError> {
        let mut files = self.files.lock().unwrap();
        let storage_path = format!("groups/{}/{}-{}", group_id, files.len(), filename);
        files.insert(storage_path.clone(), bytes.to_vec());
        Ok(StoredFile {
            storage_path: storage_path.clone(),
            public_path: Some(format!("/files/{}", storage_path)),
            file_size: bytes.len() as u64,
        })
    }

    async fn read_file(&self, storage_path: &str) -> Result<Vec<u8>, StorageError> {
        self.files
            .lock()
            .unwrap()
            .get(storage_path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(storage_path.to_string()))
    }
}

/// OCR provider returning fixed page texts.
///
/// Failures queued with `fail_next` are returned by the next page calls in
/// order. A gate installed with `install_gate` makes every page call wait
/// for a permit, which lets a test hold a job mid-OCR.
pub struct ScriptedExtractor {
    pages: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ProviderError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    panic_on_page: AtomicBool,
    count_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn with_pages(count: usize) -> Self {
        let pages = (1..=count)
            .map(|n| format!("Invoice INV-1 page {} total 10.00 EUR", n))
            .collect();
        Self {
            pages: Mutex::new(pages),
            failures: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            panic_on_page: AtomicBool::new(false),
            count_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_pages(&self, pages: Vec<String>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Page calls block until the returned semaphore hands out a permit.
    pub fn install_gate(&self, permits: usize) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(permits));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn set_panic_on_page(&self, panic: bool) {
        self.panic_on_page.store(panic, Ordering::SeqCst);
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractorPort for ScriptedExtractor {
    async fn count_pages(
        &self,
        _extractor: &Extractor,
        _document: &[u8],
        _file_type: &str,
    ) -> Result<u32, ProviderError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages.lock().unwrap().len() as u32)
    }

    async fn extract_page(&self, request: OcrPageRequest<'_>) -> Result<OcrPageOutput, ProviderError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        if self.panic_on_page.load(Ordering::SeqCst) {
            panic!("extractor crashed on page {}", request.page_index);
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let text = self
            .pages
            .lock()
            .unwrap()
            .get(request.page_index as usize)
            .cloned()
            .unwrap_or_default();
        Ok(OcrPageOutput {
            text,
            usage: Usage::pages(1),
            quality_score: Some(0.9),
        })
    }
}

/// LLM provider answering from a queue of canned replies, then a fallback.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Mutex<String>,
    usage: Mutex<Option<Usage>>,
    calls: AtomicUsize,
    user_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn answering(fallback: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback.to_string()),
            usage: Mutex::new(Some(Usage::tokens(500, 200))),
            calls: AtomicUsize::new(0),
            user_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply_with(&self, content: &str) {
        self.replies.lock().unwrap().push_back(Ok(content.to_string()));
    }

    pub fn fail_with(&self, error: ProviderError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn set_fallback(&self, content: &str) {
        *self.fallback.lock().unwrap() = content.to_string();
    }

    pub fn set_usage(&self, usage: Option<Usage>) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn user_prompts(&self) -> Vec<String> {
        self.user_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelPort for ScriptedModel {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.user_prompts
            .lock()
            .unwrap()
            .push(request.user_prompt.to_string());

        let reply = self.replies.lock().unwrap().pop_front();
        let content = match reply {
            Some(Ok(content)) => content,
            Some(Err(err)) => return Err(err),
            None => self.fallback.lock().unwrap().clone(),
        };
        Ok(Completion {
            content,
            usage: *self.usage.lock().unwrap(),
        })
    }
}

/// Wraps a job repository and fails the next N `find` calls.
pub struct FlakyJobs {
    inner: Arc<dyn JobRepository>,
    failing_finds: AtomicUsize,
    find_calls: AtomicUsize,
}

impl FlakyJobs {
    pub fn new(inner: Arc<dyn JobRepository>) -> Self {
        Self {
            inner,
            failing_finds: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_finds(&self, n: usize) {
        self.failing_finds.store(n, Ordering::SeqCst);
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRepository for FlakyJobs {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError> {
        self.inner.insert(job).await
    }

    async fn find(&self, id: &str) -> Result<Option<Job>, RepositoryError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RepositoryError::Database(DatabaseError::LockPoisoned));
        }
        self.inner.find(id).await
    }

    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> Result<bool, RepositoryError> {
        self.inner.update_if_status(job, expected).await
    }

    async fn record_cancel_request(
        &self,
        id: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.record_cancel_request(id, reason, at).await
    }

    async fn history(&self, manifest_id: Option<i64>, limit: usize) -> Result<Vec<Job>, RepositoryError> {
        self.inner.history(manifest_id, limit).await
    }

    async fn count_by_status(&self) -> Result<JobStats, RepositoryError> {
        self.inner.count_by_status().await
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, RepositoryError> {
        self.inner.list_by_status(statuses).await
    }
}
