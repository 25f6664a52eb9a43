//! Metric events emitted by the engine.

use serde::Serialize;
use std::time::Duration;

use super::RejectReason;

/// Structured events handed to the [`MetricsSink`](crate::ports::MetricsSink).
///
/// Emission points: the queue emits admission events, workers emit per-item
/// and per-attempt events, the processor emits pool and breaker events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricEvent {
    Enqueued,
    EnqueueRejected(RejectReason),
    WorkStarted,
    WorkCompleted { duration: Duration },
    WorkFailed { reason: String },
    WorkTimedOut,
    PoolResized { from: usize, to: usize },
    CircuitBreakerOpened,
    CircuitBreakerClosed,
}
