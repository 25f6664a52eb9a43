//! Work items and the replies producers can observe.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::WorkId;

/// Where outcomes for a work item are delivered.
///
/// A producer hands the sending half in with its submission and reads
/// [`WorkReply`] values off the receiving half. Delivery is best effort: a
/// producer that dropped its receiver simply stops hearing about its items.
pub type ReplyAddress = mpsc::UnboundedSender<WorkReply>;

/// One unit of work flowing through the engine.
///
/// Created by the dispatcher on accept (push mode) or pulled from the source
/// sequence (pull mode); destroyed on its final outcome.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: WorkId,
    pub payload: serde_json::Value,
    pub reply_to: Option<ReplyAddress>,

    /// Extra backend invocations allowed beyond the first.
    pub retry_budget: u32,

    /// Absolute deadline. No backend call is started or retried past it.
    pub deadline: Instant,

    pub accepted_at: Instant,
}

impl WorkItem {
    pub fn new(
        payload: serde_json::Value,
        reply_to: Option<ReplyAddress>,
        retry_budget: u32,
        timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: WorkId::new(),
            payload,
            reply_to,
            retry_budget,
            deadline: now + timeout,
            accepted_at: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, zero if it has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Deliver a reply to the producer, if one is listening.
    pub fn reply(&self, reply: WorkReply) {
        if let Some(tx) = &self.reply_to {
            let _ = tx.send(reply);
        }
    }
}

/// What a producer can observe on its reply address.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkReply {
    /// The raw backend reply, classified as a success.
    Completed(serde_json::Value),

    /// Admission was refused; the string is producer-facing.
    Rejected(String),

    /// The item was dispatched but did not complete.
    Failed(FailureReason),
}

/// Terminal failure envelope for a dispatched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The backend (or its classifier) reported an application failure.
    Application(String),

    /// The backend replied with something the checker could not classify.
    Unrecognized,

    /// No reply arrived before the item's deadline.
    TimedOut,

    /// Shutdown abandoned the item before it could finish.
    Abandoned,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Application(reason) => write!(f, "application failure: {reason}"),
            FailureReason::Unrecognized => write!(f, "unrecognized reply"),
            FailureReason::TimedOut => write!(f, "timed out"),
            FailureReason::Abandoned => write!(f, "abandoned during shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_math() {
        let item = WorkItem::new(
            serde_json::json!({}),
            None,
            0,
            Duration::from_millis(100),
        );
        let now = Instant::now();
        assert!(!item.is_expired(now));
        assert!(item.remaining(now) <= Duration::from_millis(100));

        let later = now + Duration::from_millis(200);
        assert!(item.is_expired(later));
        assert_eq!(item.remaining(later), Duration::ZERO);
    }

    #[tokio::test]
    async fn reply_is_best_effort() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let item = WorkItem::new(
            serde_json::json!({"k": 1}),
            Some(tx),
            0,
            Duration::from_secs(1),
        );
        item.reply(WorkReply::Rejected("no".into()));
        assert_eq!(rx.recv().await, Some(WorkReply::Rejected("no".into())));

        drop(rx);
        // Receiver gone: must not panic.
        item.reply(WorkReply::Completed(serde_json::json!(null)));
    }
}
