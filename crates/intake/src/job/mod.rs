//! Job records, their lifecycle and the state machine that drives them.

pub mod cancel;
pub mod context;
pub mod machine;
pub mod model;
pub mod progress;
pub mod retry;

pub use cancel::{CancelRequest, CancelSignal};
pub use machine::{JobServices, JobStateMachine, MachineError, MachineSettings};
pub use model::{Job, JobErrorKind, JobKind, JobStats, JobStatus, TransitionError};
pub use progress::{BroadcastProgress, JobEvent, JobEventBroadcaster, NoopProgress, ProgressReporter};
pub use retry::RetryPolicy;
