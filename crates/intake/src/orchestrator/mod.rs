//! Queueing, worker pool and the control surface for jobs.

pub mod pool;
pub mod queue;

pub use pool::{CancelOutcome, Orchestrator, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
pub use queue::{JobQueue, QueuedJob};
