//! Cooperative cancellation flag shared between the control surface and the
//! worker driving a job.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub requested_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Set at most once; the first request wins. The state machine polls it
/// before every unit of work and never interrupts a call in flight.
#[derive(Debug, Default)]
pub struct CancelSignal {
    request: OnceLock<CancelRequest>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a request was already recorded.
    pub fn request(&self, reason: Option<String>, requested_at: DateTime<Utc>) -> bool {
        self.request
            .set(CancelRequest {
                requested_at,
                reason,
            })
            .is_ok()
    }

    pub fn is_requested(&self) -> bool {
        self.request.get().is_some()
    }

    pub fn get(&self) -> Option<&CancelRequest> {
        self.request.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_requested());
        assert!(signal.request(Some("user".into()), Utc::now()));
        assert!(!signal.request(Some("again".into()), Utc::now()));
        assert_eq!(signal.get().unwrap().reason.as_deref(), Some("user"));
    }
}
