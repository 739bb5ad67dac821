//! In-memory FIFO of pending jobs plus the set of jobs held by workers.
//!
//! A worker takes the earliest queued job whose manifest is not already
//! being processed, so jobs for one manifest run in submission order and
//! never overlap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::job::CancelSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: String,
    pub manifest_id: i64,
}

#[derive(Debug)]
struct ActiveJob {
    manifest_id: i64,
    cancel: Arc<CancelSignal>,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    pending: VecDeque<QueuedJob>,
    active: HashMap<String, ActiveJob>,
    /// Signals of requeued jobs, handed out again when they are next taken.
    carried: HashMap<String, Arc<CancelSignal>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: impl Into<String>, manifest_id: i64) {
        self.pending.push_back(QueuedJob {
            job_id: job_id.into(),
            manifest_id,
        });
    }

    /// Releases an active job and puts it back at the head of the queue.
    /// Its cancellation signal is kept, so a request made while it was held
    /// still applies when it runs.
    pub fn requeue_front(&mut self, job_id: &str) -> bool {
        let Some(active) = self.active.remove(job_id) else {
            return false;
        };
        self.carried.insert(job_id.to_string(), active.cancel);
        self.pending.push_front(QueuedJob {
            job_id: job_id.to_string(),
            manifest_id: active.manifest_id,
        });
        true
    }

    /// Moves the next runnable job to the active set and hands out its
    /// cancellation signal.
    pub fn take_next(&mut self) -> Option<(QueuedJob, Arc<CancelSignal>)> {
        let index = self
            .pending
            .iter()
            .position(|queued| !self.is_manifest_active(queued.manifest_id))?;
        let queued = self.pending.remove(index)?;

        let cancel = self
            .carried
            .remove(&queued.job_id)
            .unwrap_or_else(|| Arc::new(CancelSignal::new()));
        self.active.insert(
            queued.job_id.clone(),
            ActiveJob {
                manifest_id: queued.manifest_id,
                cancel: Arc::clone(&cancel),
            },
        );
        Some((queued, cancel))
    }

    /// Drops a job that has not started yet. The order of the remaining
    /// jobs is unchanged.
    pub fn remove_queued(&mut self, job_id: &str) -> bool {
        match self.pending.iter().position(|q| q.job_id == job_id) {
            Some(index) => {
                self.carried.remove(job_id);
                self.pending.remove(index).is_some()
            }
            None => false,
        }
    }

    pub fn active_signal(&self, job_id: &str) -> Option<Arc<CancelSignal>> {
        self.active.get(job_id).map(|a| Arc::clone(&a.cancel))
    }

    /// Releases a job taken with `take_next`.
    pub fn finish(&mut self, job_id: &str) {
        self.active.remove(job_id);
    }

    pub fn is_queued(&self, job_id: &str) -> bool {
        self.pending.iter().any(|q| q.job_id == job_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    fn is_manifest_active(&self, manifest_id: i64) -> bool {
        self.active.values().any(|a| a.manifest_id == manifest_id)
    }
}
