//! The worker pool that pulls queued jobs and runs them to a terminal state.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::queue::JobQueue;
use crate::config::Config;
use crate::error::{OrchestratorError, RepositoryError};
use crate::job::{
    BroadcastProgress, CancelSignal, Job, JobErrorKind, JobEvent, JobEventBroadcaster, JobKind,
    JobServices, JobStateMachine, JobStats, JobStatus, RetryPolicy,
};
use crate::job::machine::MAX_ERROR_CHARS;
use crate::ports::JobRepository;
use crate::sanitize::truncate;

/// How long an idle worker sleeps before re-checking the queue.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Backoff for repository calls a worker must not give up on quickly.
const STORE_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_millis(50),
    max_delay: Duration::from_millis(500),
};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Message stored on jobs found mid-flight at startup.
const INTERRUPTED: &str = "interrupted: the orchestrator stopped while the job was running";

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    /// True if the job is canceled or will cancel at its next checkpoint.
    pub canceled: bool,
    /// True if the job never started and was taken off the queue.
    pub removed_from_queue: bool,
    /// Job status after the request.
    pub state: JobStatus,
}

struct Shared {
    machine: Arc<JobStateMachine>,
    queue: Mutex<JobQueue>,
    notify: Notify,
    shutdown: AtomicBool,
    events: JobEventBroadcaster,
}

impl Shared {
    fn jobs(&self) -> &dyn JobRepository {
        self.machine.services().jobs.as_ref()
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Recovers jobs left behind by a previous process and spawns
    /// `config.orchestrator.worker_count` workers.
    ///
    /// Jobs found in a running state are failed as interrupted (or canceled
    /// if a cancellation was already requested). Pending jobs are re-queued
    /// oldest first.
    pub async fn start(services: JobServices, config: &Config) -> Result<Self, OrchestratorError> {
        let worker_count = config.orchestrator.worker_count.max(1);
        let shared = Arc::new(Shared {
            machine: Arc::new(JobStateMachine::new(services)),
            queue: Mutex::new(JobQueue::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            events: JobEventBroadcaster::new(config.orchestrator.event_capacity.max(1)),
        });

        recover(&shared).await?;

        let workers = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(
                    run_worker(worker_id, shared).instrument(info_span!("worker", worker_id)),
                )
            })
            .collect();

        info!(workers = worker_count, "Orchestrator started");

        Ok(Self { shared, workers })
    }

    /// Creates a job for `manifest_id` and queues it.
    pub async fn submit_job(
        &self,
        manifest_id: i64,
        kind: JobKind,
        field_name: Option<String>,
    ) -> Result<String, OrchestratorError> {
        if self.is_shutdown() {
            return Err(OrchestratorError::ShutDown);
        }

        let field_name = field_name
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        match (kind, &field_name) {
            (JobKind::FieldReExtraction, None) => {
                return Err(OrchestratorError::InvalidSubmission(
                    "field_re_extraction jobs require a field name".to_string(),
                ))
            }
            (JobKind::Extraction, Some(_)) => {
                return Err(OrchestratorError::InvalidSubmission(
                    "a field name is only valid for field_re_extraction jobs".to_string(),
                ))
            }
            _ => {}
        }

        let services = self.shared.machine.services();
        if services.manifests.find(manifest_id).await?.is_none() {
            return Err(OrchestratorError::ManifestNotFound(manifest_id));
        }

        let job = Job::new(manifest_id, kind, field_name);
        services.jobs.insert(&job).await?;
        self.shared.queue.lock().await.push(job.id.clone(), manifest_id);
        self.shared.events.send(JobEvent::from_job(&job, "Queued"));
        self.shared.notify.notify_one();

        info!(job_id = %job.id, manifest_id, kind = kind.as_str(), "Job submitted");
        Ok(job.id)
    }

    /// Requests cancellation of a job.
    ///
    /// A queued job is removed and canceled at once with zero cost. A running
    /// job is flagged and stops at its next checkpoint. Terminal jobs are left
    /// untouched and reported with `canceled = false`.
    pub async fn cancel_job(
        &self,
        job_id: &str,
        reason: Option<&str>,
    ) -> Result<CancelOutcome, OrchestratorError> {
        let jobs = self.shared.jobs();
        let job = jobs
            .find(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(not_canceled(job.status));
        }

        let now = Utc::now();
        let (removed, signal) = {
            let mut queue = self.shared.queue.lock().await;
            let removed = queue.remove_queued(job_id);
            (removed, queue.active_signal(job_id))
        };

        if removed {
            info!(job_id, "Canceling queued job");
            let outcome = finalize_cancel(&self.shared, job, reason, now).await?;
            return Ok(CancelOutcome {
                removed_from_queue: outcome.canceled,
                ..outcome
            });
        }

        if let Some(signal) = signal {
            if !jobs.record_cancel_request(job_id, reason, now).await? {
                return Ok(not_canceled(current_status(jobs, job_id).await?));
            }
            signal.request(reason.map(str::to_string), now);
            info!(job_id, "Cancellation requested for running job");
            return Ok(CancelOutcome {
                canceled: true,
                removed_from_queue: false,
                state: current_status(jobs, job_id).await?,
            });
        }

        // Neither queued nor held by a worker, e.g. left pending after a
        // shutdown. Nothing else will touch it, so finish it here.
        let job = jobs
            .find(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(not_canceled(job.status));
        }
        finalize_cancel(&self.shared, job, reason, now).await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, OrchestratorError> {
        Ok(self.shared.jobs().find(job_id).await?)
    }

    /// Jobs newest first. `limit` defaults to 50 and is clamped to 1..=200.
    pub async fn job_history(
        &self,
        manifest_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.shared.jobs().history(manifest_id, limit).await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, OrchestratorError> {
        Ok(self.shared.jobs().count_by_status().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Stops handing out jobs. Jobs already running finish normally; queued
    /// jobs stay pending and are picked up again on the next start.
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator...");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Waits for every worker to exit. Call `shutdown` first.
    pub async fn wait(self) {
        let results = futures_util::future::join_all(self.workers).await;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => debug!(worker_id = i, "Worker finished"),
                Err(e) => error!(worker_id = i, error = %e, "Worker task failed"),
            }
        }
        info!("All workers have stopped");
    }
}

fn not_canceled(state: JobStatus) -> CancelOutcome {
    CancelOutcome {
        canceled: false,
        removed_from_queue: false,
        state,
    }
}

async fn current_status(jobs: &dyn JobRepository, job_id: &str) -> Result<JobStatus, OrchestratorError> {
    jobs.find(job_id)
        .await?
        .map(|job| job.status)
        .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
}

/// Moves a job that no worker holds to `Canceled`, through
/// `CancelRequested` unless it never left `Pending`.
async fn finalize_cancel(
    shared: &Shared,
    mut job: Job,
    reason: Option<&str>,
    requested_at: chrono::DateTime<Utc>,
) -> Result<CancelOutcome, OrchestratorError> {
    let jobs = shared.jobs();
    job.cancel_requested_at.get_or_insert(requested_at);
    if job.cancel_reason.is_none() {
        job.cancel_reason = reason.map(str::to_string);
    }

    if job.status != JobStatus::Pending && job.status != JobStatus::CancelRequested {
        let from = job.status;
        if job.transition(JobStatus::CancelRequested).is_err()
            || !jobs.update_if_status(&job, from).await?
        {
            return Ok(not_canceled(current_status(jobs, &job.id).await?));
        }
    }

    let from = job.status;
    if job.transition(JobStatus::Canceled).is_err() || !jobs.update_if_status(&job, from).await? {
        return Ok(not_canceled(current_status(jobs, &job.id).await?));
    }

    shared.events.send(JobEvent::from_job(&job, "Canceled"));
    info!(job_id = %job.id, "Job canceled");
    Ok(CancelOutcome {
        canceled: true,
        removed_from_queue: false,
        state: JobStatus::Canceled,
    })
}

async fn recover(shared: &Shared) -> Result<(), RepositoryError> {
    let jobs = shared.jobs();

    for mut job in jobs.list_by_status(&JobStatus::RUNNING).await? {
        let from = job.status;
        let outcome = if from == JobStatus::CancelRequested {
            job.transition(JobStatus::Canceled)
        } else {
            job.fail(JobErrorKind::Internal, INTERRUPTED)
        };
        if outcome.is_ok() && jobs.update_if_status(&job, from).await? {
            warn!(job_id = %job.id, from = %from, to = %job.status, "Recovered interrupted job");
            shared.events.send(JobEvent::from_job(&job, "Recovered after restart"));
        }
    }

    let pending = jobs.list_by_status(&[JobStatus::Pending]).await?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Re-queueing pending jobs");
    }
    let mut queue = shared.queue.lock().await;
    for job in pending {
        queue.push(job.id, job.manifest_id);
    }
    Ok(())
}

async fn run_worker(worker_id: usize, shared: Arc<Shared>) {
    debug!("Worker {} started", worker_id);

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let next = shared.queue.lock().await.take_next();
        let Some((queued, cancel)) = next else {
            let _ = tokio::time::timeout(IDLE_POLL, shared.notify.notified()).await;
            continue;
        };

        let outcome = process(&shared, &queued.job_id, cancel).await;

        {
            let mut queue = shared.queue.lock().await;
            match outcome {
                Processed::Settled => queue.finish(&queued.job_id),
                Processed::Requeue => {
                    warn!(job_id = %queued.job_id, "Returning job to the head of the queue");
                    queue.requeue_front(&queued.job_id);
                }
            }
        }
        // Another job for the same manifest may now be runnable.
        shared.notify.notify_one();
    }

    debug!("Worker {} stopped", worker_id);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    /// The job ran, is terminal, or no longer exists.
    Settled,
    /// The store could not be reached; the job is still pending.
    Requeue,
}

/// Runs one job in its own task so that a panic is contained to that job.
async fn process(shared: &Shared, job_id: &str, cancel: Arc<CancelSignal>) -> Processed {
    let job = match load_job(shared.jobs(), job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id, "Queued job disappeared before it could run");
            return Processed::Settled;
        }
        Err(e) => {
            error!(job_id, error = %e, "Failed to load queued job");
            let message = format!("failed to load job: {}", e);
            return if force_fail(shared, job_id, JobErrorKind::Internal, &message).await {
                Processed::Settled
            } else {
                Processed::Requeue
            };
        }
    };
    if job.status.is_terminal() {
        debug!(job_id, status = %job.status, "Skipping terminal job");
        return Processed::Settled;
    }

    let machine = Arc::clone(&shared.machine);
    let progress = BroadcastProgress::new(shared.events.clone());
    let handle = tokio::spawn(async move { machine.run(job, cancel, &progress).await });

    match handle.await {
        Ok(Ok(job)) => {
            debug!(job_id, status = %job.status, "Job finished");
        }
        Ok(Err(e)) => {
            error!(job_id, error = %e, "Job could not record its outcome");
            force_fail(shared, job_id, JobErrorKind::Internal, &e.to_string()).await;
        }
        Err(e) => {
            let message = if e.is_panic() {
                format!("worker panicked: {}", panic_message(e.into_panic()))
            } else {
                "worker task was aborted".to_string()
            };
            error!(job_id, error = %message, "Job task failed");
            force_fail(shared, job_id, JobErrorKind::WorkerPanic, &message).await;
        }
    }
    // A job the machine already moved past pending is not run again. If it
    // could not be failed here, startup recovery fails it as interrupted.
    Processed::Settled
}

async fn load_job(jobs: &dyn JobRepository, job_id: &str) -> Result<Option<Job>, RepositoryError> {
    let mut attempt = 1;
    loop {
        match jobs.find(job_id).await {
            Ok(found) => return Ok(found),
            Err(e) if STORE_RETRY.allows_retry_after(attempt) => {
                warn!(job_id, attempt, error = %e, "Failed to load job, retrying");
                tokio::time::sleep(STORE_RETRY.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Marks a job failed after its state machine gave up. Re-reads and retries
/// when another writer moved the job in between, and backs off on store
/// errors. Terminal jobs are left as they are.
///
/// Returns false if the job is still not terminal afterwards.
async fn force_fail(shared: &Shared, job_id: &str, kind: JobErrorKind, message: &str) -> bool {
    let jobs = shared.jobs();

    for attempt in 1..=STORE_RETRY.max_attempts {
        let stored = match jobs.find(job_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(job_id, attempt, error = %e, "Failed to reload job for failure");
                backoff(attempt).await;
                continue;
            }
        };
        let Some(mut job) = stored else {
            return true;
        };
        if job.status.is_terminal() {
            return true;
        }

        let from = job.status;
        if let Err(e) = job.fail(kind, truncate(message, MAX_ERROR_CHARS)) {
            error!(job_id, error = %e, "Job cannot be failed");
            return false;
        }
        match jobs.update_if_status(&job, from).await {
            Ok(true) => {
                shared.events.send(JobEvent::from_job(&job, "Failed"));
                return true;
            }
            Ok(false) => continue,
            Err(e) => {
                warn!(job_id, attempt, error = %e, "Failed to persist job failure");
                backoff(attempt).await;
            }
        }
    }
    error!(job_id, "Gave up marking job failed");
    false
}

async fn backoff(attempt: u32) {
    if STORE_RETRY.allows_retry_after(attempt) {
        tokio::time::sleep(STORE_RETRY.delay_for(attempt)).await;
    }
}
