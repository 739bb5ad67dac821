//! Job progress events for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::model::{Job, JobStatus};

/// Progress event for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub manifest_id: i64,
    pub status: JobStatus,
    /// Percentage, 0 to 100.
    pub progress: u8,
    /// Human-readable description of the current activity.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn from_job(job: &Job, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            manifest_id: job.manifest_id,
            status: job.status,
            progress: job.progress,
            message: message.into(),
            timestamp: Utc::now(),
            error: job.error.clone(),
        }
    }
}

/// Fans job events out to every subscriber.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> Arc<broadcast::Sender<JobEvent>> {
        Arc::clone(&self.sender)
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: JobEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: JobEvent) {}
}

/// Bridges state machine events to the broadcast channel.
pub struct BroadcastProgress {
    broadcaster: JobEventBroadcaster,
}

impl BroadcastProgress {
    pub fn new(broadcaster: JobEventBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: JobEvent) {
        self.broadcaster.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::JobKind;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let broadcaster = JobEventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let reporter = BroadcastProgress::new(broadcaster.clone());

        let job = Job::new(7, JobKind::Extraction, None);
        reporter.report(JobEvent::from_job(&job, "Queued"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.manifest_id, 7);
        assert_eq!(event.status, JobStatus::Pending);
        assert_eq!(event.message, "Queued");
    }

    #[test]
    fn test_send_without_subscribers_is_ignored() {
        let broadcaster = JobEventBroadcaster::new(1);
        let job = Job::new(1, JobKind::Extraction, None);
        broadcaster.send(JobEvent::from_job(&job, "nobody listening"));
    }
}
