//! Domain model (ids, work items, replies, outcomes, metric events).

pub mod events;
pub mod ids;
pub mod item;
pub mod outcome;

pub use events::MetricEvent;
pub use ids::WorkId;
pub use item::{FailureReason, ReplyAddress, WorkItem, WorkReply};
pub use outcome::{EnqueueOutcome, RejectReason, WorkOutcome};
