//! The job record and its lifecycle rules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cost::JobCost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    OcrRunning,
    OcrDone,
    ExtractionRunning,
    ValidationRunning,
    CancelRequested,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::OcrRunning,
        JobStatus::OcrDone,
        JobStatus::ExtractionRunning,
        JobStatus::ValidationRunning,
        JobStatus::CancelRequested,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    /// Statuses a worker owns while it drives a job.
    pub const RUNNING: [JobStatus; 5] = [
        JobStatus::OcrRunning,
        JobStatus::OcrDone,
        JobStatus::ExtractionRunning,
        JobStatus::ValidationRunning,
        JobStatus::CancelRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::OcrRunning => "ocr_running",
            JobStatus::OcrDone => "ocr_done",
            JobStatus::ExtractionRunning => "extraction_running",
            JobStatus::ValidationRunning => "validation_running",
            JobStatus::CancelRequested => "cancel_requested",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | CancelRequested => *self != CancelRequested || next == Failed,
            Canceled => matches!(self, Pending | CancelRequested),
            OcrRunning => *self == Pending,
            OcrDone => *self == OcrRunning,
            ExtractionRunning => *self == OcrDone,
            ValidationRunning => *self == ExtractionRunning,
            // Pending -> Completed only when a duplicate short-circuits.
            Completed => matches!(self, ValidationRunning | Pending),
            Pending => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Extract the whole schema from the document.
    Extraction,
    /// Re-extract one field and merge it into the stored data.
    FieldReExtraction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extraction => "extraction",
            JobKind::FieldReExtraction => "field_re_extraction",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(JobKind::Extraction),
            "field_re_extraction" => Ok(JobKind::FieldReExtraction),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Classification of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// A provider kept failing after all retries.
    Transient,
    /// The model never produced output that satisfied the schema.
    SchemaMismatch,
    /// OCR text does not fit the model's context window.
    OcrContextTooLarge,
    NoPricingData,
    /// A provider rejected the request outright.
    Provider,
    /// A stored script no longer parses.
    ScriptSyntax,
    ValidationFailed,
    Configuration,
    Storage,
    Internal,
    WorkerPanic,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::Transient => "transient",
            JobErrorKind::SchemaMismatch => "schema_mismatch",
            JobErrorKind::OcrContextTooLarge => "ocr_context_too_large",
            JobErrorKind::NoPricingData => "no_pricing_data",
            JobErrorKind::Provider => "provider",
            JobErrorKind::ScriptSyntax => "script_syntax",
            JobErrorKind::ValidationFailed => "validation_failed",
            JobErrorKind::Configuration => "configuration",
            JobErrorKind::Storage => "storage",
            JobErrorKind::Internal => "internal",
            JobErrorKind::WorkerPanic => "worker_panic",
        }
    }
}

impl FromStr for JobErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use JobErrorKind::*;
        [
            Transient,
            SchemaMismatch,
            OcrContextTooLarge,
            NoPricingData,
            Provider,
            ScriptSyntax,
            ValidationFailed,
            Configuration,
            Storage,
            Internal,
            WorkerPanic,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| format!("unknown job error kind '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One attempt to extract a document (or one of its fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub manifest_id: i64,
    pub kind: JobKind,
    pub field_name: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub assistant_response: Option<String>,
    pub attempt_count: u32,
    pub estimated_cost: JobCost,
    pub actual_cost: JobCost,
    pub llm_input_tokens: u64,
    pub llm_output_tokens: u64,
    pub pages_processed: u32,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(manifest_id: i64, kind: JobKind, field_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            manifest_id,
            kind,
            field_name,
            status: JobStatus::Pending,
            progress: 0,
            model_id: None,
            system_prompt: None,
            user_prompt: None,
            assistant_response: None,
            attempt_count: 0,
            estimated_cost: JobCost::default(),
            actual_cost: JobCost::default(),
            llm_input_tokens: 0,
            llm_output_tokens: 0,
            pages_processed: 0,
            cancel_requested_at: None,
            cancel_reason: None,
            canceled_at: None,
            started_at: None,
            completed_at: None,
            error: None,
            error_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the job as picked up by a worker.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.attempt_count = self.attempt_count.max(1);
        self.touch();
    }

    /// Moves the job to `next`, stamping the timestamps that belong to it.
    pub fn transition(&mut self, next: JobStatus) -> Result<JobStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(TransitionError { from, to: next });
        }

        let now = Utc::now();
        match next {
            JobStatus::Completed => {
                self.completed_at = Some(now);
                self.error = None;
                self.error_kind = None;
                self.progress = 100;
            }
            JobStatus::Failed => {
                self.completed_at = Some(now);
            }
            JobStatus::CancelRequested => {
                self.cancel_requested_at.get_or_insert(now);
            }
            JobStatus::Canceled => {
                let requested = *self.cancel_requested_at.get_or_insert(now);
                self.canceled_at = Some(now.max(requested));
            }
            _ => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(from)
    }

    /// Records a failure and moves to `Failed`.
    pub fn fail(&mut self, kind: JobErrorKind, message: impl Into<String>) -> Result<JobStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(JobStatus::Failed) {
            return Err(TransitionError {
                from,
                to: JobStatus::Failed,
            });
        }
        self.error = Some(message.into());
        self.error_kind = Some(kind);
        self.transition(JobStatus::Failed)
    }

    /// Raises progress; never lowers it.
    pub fn advance_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub counts: std::collections::BTreeMap<JobStatus, u64>,
    pub total: u64,
}

impl JobStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (JobStatus, u64)>) -> Self {
        let mut stats = JobStats::default();
        for status in JobStatus::ALL {
            stats.counts.insert(status, 0);
        }
        for (status, count) in counts {
            *stats.counts.entry(status).or_default() += count;
            stats.total += count;
        }
        stats
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(1, JobKind::Extraction, None);
        for next in [
            JobStatus::OcrRunning,
            JobStatus::OcrDone,
            JobStatus::ExtractionRunning,
            JobStatus::ValidationRunning,
            JobStatus::Completed,
        ] {
            job.transition(next).unwrap();
        }
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }

        let mut job = Job::new(1, JobKind::Extraction, None);
        job.transition(JobStatus::Canceled).unwrap();
        assert!(job.transition(JobStatus::OcrRunning).is_err());
        assert!(job.fail(JobErrorKind::Internal, "late").is_err());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_stages_cannot_be_skipped() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::ExtractionRunning));
        assert!(!JobStatus::OcrRunning.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::OcrDone.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_cancel_requested_only_leads_to_canceled_or_failed() {
        let from = JobStatus::CancelRequested;
        let allowed: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|n| from.can_transition_to(*n))
            .collect();
        assert_eq!(allowed, vec![JobStatus::Failed, JobStatus::Canceled]);
    }

    #[test]
    fn test_cancel_timestamps_ordered() {
        let mut job = Job::new(1, JobKind::Extraction, None);
        job.transition(JobStatus::OcrRunning).unwrap();
        job.transition(JobStatus::CancelRequested).unwrap();
        job.transition(JobStatus::Canceled).unwrap();
        let requested = job.cancel_requested_at.unwrap();
        let canceled = job.canceled_at.unwrap();
        assert!(requested <= canceled);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = Job::new(1, JobKind::Extraction, None);
        job.advance_progress(40);
        job.advance_progress(10);
        assert_eq!(job.progress, 40);
        job.advance_progress(250);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_stats_include_every_status() {
        let stats = JobStats::from_counts([(JobStatus::Completed, 3), (JobStatus::Failed, 1)]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.count(JobStatus::Completed), 3);
        assert_eq!(stats.count(JobStatus::Pending), 0);
        assert_eq!(stats.counts.len(), JobStatus::ALL.len());
    }

    #[test]
    fn test_start_sets_attempt_count() {
        let mut job = Job::new(1, JobKind::Extraction, None);
        assert_eq!(job.attempt_count, 0);
        job.start();
        assert_eq!(job.attempt_count, 1);
        assert!(job.started_at.is_some());
    }
}
