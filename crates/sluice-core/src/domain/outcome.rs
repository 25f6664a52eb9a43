//! Admission and execution outcome types.
//!
//! These are the engine's two classification points: the queue classifies a
//! submission (admit or reject, synchronously), and the result checker
//! classifies a raw backend reply (after the fact).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Synchronous answer to an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Buffer full or projected wait above the configured threshold.
    OverCapacity,

    /// The item's deadline had already passed on arrival.
    Expired,

    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OverCapacity => write!(f, "over capacity"),
            RejectReason::Expired => write!(f, "expired"),
            RejectReason::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Classification of one raw backend reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkOutcome {
    Success(serde_json::Value),

    ApplicationFailure { reason: String, retryable: bool },

    /// The checker could not make sense of the reply. Fatal for the attempt,
    /// never retried.
    Unrecognized(serde_json::Value),
}

impl WorkOutcome {
    pub fn success(reply: serde_json::Value) -> Self {
        WorkOutcome::Success(reply)
    }

    pub fn failure(reason: impl Into<String>, retryable: bool) -> Self {
        WorkOutcome::ApplicationFailure {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn unrecognized(raw: serde_json::Value) -> Self {
        WorkOutcome::Unrecognized(raw)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors() {
        assert!(WorkOutcome::success(serde_json::json!(1)).is_success());
        assert!(!WorkOutcome::failure("nope", true).is_success());
        assert!(!WorkOutcome::unrecognized(serde_json::json!("??")).is_success());
    }

    #[test]
    fn outcome_roundtrip_json() {
        let o = WorkOutcome::failure("oops", true);
        let s = serde_json::to_string(&o).unwrap();
        let back: WorkOutcome = serde_json::from_str(&s).unwrap();
        assert_eq!(back, o);
    }

    #[test]
    fn reject_reason_display() {
        assert_eq!(RejectReason::OverCapacity.to_string(), "over capacity");
        assert_eq!(RejectReason::ShuttingDown.to_string(), "shutting down");
    }
}
