//! Tests for the worker pool: submission, cancellation, history, recovery
//! and shutdown.

mod common;

use std::time::Duration;

use common::*;
use intake::job::JobStatus;
use intake::ports::JobRepository;
use intake::{Amount, Job, JobErrorKind, JobKind, OrchestratorError};

fn single_worker() -> intake::Config {
    let mut config = test_config();
    config.orchestrator.worker_count = 1;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submitted_job_completes_and_broadcasts_progress() {
    let h = TestHarness::new().await;
    let manifest = h.upload("invoice.pdf", &document("submit")).await;
    let orchestrator = h.start().await;
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let job = wait_for_terminal(&orchestrator, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.actual_cost.total(), Amount::from_nanos(13_250_000));

    let mut seen = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        assert_eq!(event.job_id, job_id);
        seen.push(event.status);
        if event.status == JobStatus::Completed {
            break;
        }
    }
    assert_eq!(seen.first(), Some(&JobStatus::Pending));
    assert!(seen.contains(&JobStatus::OcrRunning));
    assert_eq!(seen.last(), Some(&JobStatus::Completed));

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_queued_job() {
    let h = TestHarness::with_config(single_worker()).await;
    let gate = h.extractor.install_gate(0);
    let busy = h.upload("busy.pdf", &document("busy")).await;
    let waiting = h.upload("waiting.pdf", &document("waiting")).await;
    let orchestrator = h.start().await;

    let busy_id = orchestrator
        .submit_job(busy.id, JobKind::Extraction, None)
        .await
        .unwrap();
    wait_until(&orchestrator, &busy_id, |job| job.status == JobStatus::OcrRunning).await;
    let queued_id = orchestrator
        .submit_job(waiting.id, JobKind::Extraction, None)
        .await
        .unwrap();

    let outcome = orchestrator
        .cancel_job(&queued_id, Some("uploaded by mistake"))
        .await
        .unwrap();

    assert!(outcome.canceled);
    assert!(outcome.removed_from_queue);
    assert_eq!(outcome.state, JobStatus::Canceled);

    let canceled = h.job(&queued_id).await;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.actual_cost.total(), Amount::ZERO);
    assert_eq!(canceled.pages_processed, 0);
    assert_eq!(canceled.cancel_reason.as_deref(), Some("uploaded by mistake"));
    assert!(canceled.canceled_at >= canceled.cancel_requested_at);

    gate.add_permits(100);
    let busy = wait_for_terminal(&orchestrator, &busy_id).await;
    assert_eq!(busy.status, JobStatus::Completed);
    assert_eq!(h.job(&queued_id).await.status, JobStatus::Canceled);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job_keeps_incurred_cost() {
    let h = TestHarness::new().await;
    let gate = h.extractor.install_gate(2);
    let manifest = h.upload("invoice.pdf", &document("running")).await;
    let orchestrator = h.start().await;

    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    // The third page call is in flight and waiting on the gate.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.extractor.page_calls() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "OCR never reached page 3");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let outcome = orchestrator
        .cancel_job(&job_id, Some("changed my mind"))
        .await
        .unwrap();
    assert!(outcome.canceled);
    assert!(!outcome.removed_from_queue);
    assert!(!outcome.state.is_terminal());

    gate.add_permits(100);
    let job = wait_for_terminal(&orchestrator, &job_id).await;

    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.error_kind.is_none());
    // The page in flight finishes and is billed; nothing after it runs.
    assert_eq!(job.pages_processed, 3);
    assert_eq!(job.actual_cost.ocr, Amount::from_nanos(3_000_000));
    assert_eq!(job.actual_cost.llm, Amount::ZERO);
    assert_eq!(h.extractor.page_calls(), 3);
    assert_eq!(h.model.calls(), 0);
    assert_eq!(job.cancel_reason.as_deref(), Some("changed my mind"));
    let requested = job.cancel_requested_at.unwrap();
    assert!(job.canceled_at.unwrap() >= requested);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_terminal_job_is_noop() {
    let h = TestHarness::new().await;
    let manifest = h.upload("invoice.pdf", &document("terminal")).await;
    let orchestrator = h.start().await;
    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let finished = wait_for_terminal(&orchestrator, &job_id).await;

    let outcome = orchestrator.cancel_job(&job_id, Some("too late")).await.unwrap();

    assert!(!outcome.canceled);
    assert!(!outcome.removed_from_queue);
    assert_eq!(outcome.state, JobStatus::Completed);
    let after = h.job(&job_id).await;
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.completed_at, finished.completed_at);
    assert!(after.cancel_requested_at.is_none());
    assert!(after.cancel_reason.is_none());

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let h = TestHarness::new().await;
    let orchestrator = h.start().await;

    let err = orchestrator.cancel_job("no-such-job", None).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::JobNotFound(id) if id == "no-such-job"));
    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test]
async fn test_submit_rejects_invalid_requests() {
    let h = TestHarness::new().await;
    let manifest = h.upload("invoice.pdf", &document("invalid")).await;
    let orchestrator = h.start().await;

    let err = orchestrator
        .submit_job(manifest.id, JobKind::FieldReExtraction, Some("  ".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));

    let err = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, Some("total".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidSubmission(_)));

    let err = orchestrator
        .submit_job(999, JobKind::Extraction, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ManifestNotFound(999)));

    orchestrator.shutdown();
    let err = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ShutDown));

    let stats = orchestrator.job_stats().await.unwrap();
    assert_eq!(stats.total, 0);
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_and_stats() {
    let h = TestHarness::new().await;
    let orchestrator = h.start().await;

    let mut ids = Vec::new();
    let mut manifests = Vec::new();
    for n in 0..3 {
        let manifest = h.upload(&format!("invoice-{}.pdf", n), &document(&n.to_string())).await;
        let id = orchestrator
            .submit_job(manifest.id, JobKind::Extraction, None)
            .await
            .unwrap();
        wait_for_terminal(&orchestrator, &id).await;
        ids.push(id);
        manifests.push(manifest);
    }

    let recent = orchestrator.job_history(None, Some(2)).await.unwrap();
    let recent_ids: Vec<&str> = recent.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(recent_ids, vec![ids[2].as_str(), ids[1].as_str()]);

    let for_first = orchestrator
        .job_history(Some(manifests[0].id), None)
        .await
        .unwrap();
    assert_eq!(for_first.len(), 1);
    assert_eq!(for_first[0].id, ids[0]);

    let clamped = orchestrator.job_history(None, Some(0)).await.unwrap();
    assert_eq!(clamped.len(), 1);
    let all = orchestrator.job_history(None, Some(10_000)).await.unwrap();
    assert_eq!(all.len(), 3);

    let stats = orchestrator.job_stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.count(JobStatus::Completed), 3);
    assert_eq!(stats.count(JobStatus::Failed), 0);
    assert_eq!(stats.count(JobStatus::Pending), 0);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_panic_fails_only_that_job() {
    let h = TestHarness::with_config(single_worker()).await;
    let first = h.upload("crash.pdf", &document("crash")).await;
    let second = h.upload("fine.pdf", &document("fine")).await;
    let orchestrator = h.start().await;

    h.extractor.set_panic_on_page(true);
    let crashed_id = orchestrator
        .submit_job(first.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let crashed = wait_for_terminal(&orchestrator, &crashed_id).await;

    assert_eq!(crashed.status, JobStatus::Failed);
    assert_eq!(crashed.error_kind, Some(JobErrorKind::WorkerPanic));
    assert!(crashed.error.unwrap().contains("extractor crashed"));

    h.extractor.set_panic_on_page(false);
    let next_id = orchestrator
        .submit_job(second.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let next = wait_for_terminal(&orchestrator, &next_id).await;
    assert_eq!(next.status, JobStatus::Completed);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_recovers_interrupted_jobs() {
    let h = TestHarness::new().await;
    let manifest = h.upload("invoice.pdf", &document("recovery")).await;

    let mut interrupted = Job::new(manifest.id, JobKind::Extraction, None);
    interrupted.start();
    interrupted.transition(JobStatus::OcrRunning).unwrap();
    let mut cancel_pending = Job::new(manifest.id, JobKind::Extraction, None);
    cancel_pending.start();
    cancel_pending.transition(JobStatus::OcrRunning).unwrap();
    cancel_pending.transition(JobStatus::CancelRequested).unwrap();
    cancel_pending.cancel_reason = Some("user".to_string());
    let pending = Job::new(manifest.id, JobKind::Extraction, None);
    for job in [&interrupted, &cancel_pending, &pending] {
        JobRepository::insert(h.store.as_ref(), job).await.unwrap();
    }

    let orchestrator = h.start().await;

    let failed = h.job(&interrupted.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::Internal));

    let canceled = h.job(&cancel_pending.id).await;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.cancel_reason.as_deref(), Some("user"));
    assert!(canceled.canceled_at >= canceled.cancel_requested_at);

    let resumed = wait_for_terminal(&orchestrator, &pending.id).await;
    assert_eq!(resumed.status, JobStatus::Completed);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lets_running_job_finish() {
    let h = TestHarness::with_config(single_worker()).await;
    let gate = h.extractor.install_gate(0);
    let running = h.upload("running.pdf", &document("shutdown-running")).await;
    let queued = h.upload("queued.pdf", &document("shutdown-queued")).await;
    let orchestrator = h.start().await;

    let running_id = orchestrator
        .submit_job(running.id, JobKind::Extraction, None)
        .await
        .unwrap();
    wait_until(&orchestrator, &running_id, |job| job.status == JobStatus::OcrRunning).await;
    let queued_id = orchestrator
        .submit_job(queued.id, JobKind::Extraction, None)
        .await
        .unwrap();

    orchestrator.shutdown();
    assert!(orchestrator.is_shutdown());
    gate.add_permits(100);
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait())
        .await
        .expect("workers did not stop");

    assert_eq!(h.job(&running_id).await.status, JobStatus::Completed);
    assert_eq!(h.job(&queued_id).await.status, JobStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_lookup_survives_transient_store_errors() {
    let h = TestHarness::with_config(single_worker()).await;
    let manifest = h.upload("invoice.pdf", &document("flaky-lookup")).await;
    let (orchestrator, jobs) = h.start_with_flaky_jobs().await;
    jobs.fail_next_finds(2);

    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let job = h.wait_for_job(&job_id, |job| job.status.is_terminal()).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.actual_cost.total(), Amount::from_nanos(13_250_000));
    assert_eq!(jobs.find_calls(), 3);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_that_cannot_be_loaded_is_failed() {
    let h = TestHarness::with_config(single_worker()).await;
    let manifest = h.upload("invoice.pdf", &document("lost-lookup")).await;
    let (orchestrator, jobs) = h.start_with_flaky_jobs().await;
    jobs.fail_next_finds(3);

    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let job = h.wait_for_job(&job_id, |job| job.status.is_terminal()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(JobErrorKind::Internal));
    assert!(job.error.as_deref().unwrap().contains("failed to load job"));
    assert_eq!(job.actual_cost.total(), Amount::ZERO);
    assert_eq!(h.extractor.page_calls(), 0);

    orchestrator.shutdown();
    orchestrator.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_job_is_requeued_and_runs_later() {
    let h = TestHarness::with_config(single_worker()).await;
    let manifest = h.upload("invoice.pdf", &document("requeued")).await;
    let (orchestrator, jobs) = h.start_with_flaky_jobs().await;
    // Enough failures to exhaust both the lookup and the attempt to fail it.
    jobs.fail_next_finds(6);

    let job_id = orchestrator
        .submit_job(manifest.id, JobKind::Extraction, None)
        .await
        .unwrap();
    let job = h.wait_for_job(&job_id, |job| job.status.is_terminal()).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_kind.is_none());
    assert_eq!(jobs.find_calls(), 7);

    orchestrator.shutdown();
    orchestrator.wait().await;
}
