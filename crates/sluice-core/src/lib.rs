//! sluice-core
//!
//! A work-dispatch runtime that sits between message producers and a pool of
//! worker-driven backends: it absorbs bursts, smooths them into a
//! capacity-controlled stream, and protects the backend from overload while
//! keeping producers informed about rejection and completion.
//!
//! Module map:
//! - domain: work items, replies, outcomes, metric events, ids
//! - ports: Backend / ResultChecker / MetricsSink / Clock seams
//! - config: settings records + external config shape
//! - queue: bounded FIFO with backpressure, plus the pull-mode variant
//! - pool: worker loop, circuit breaker, queue processor
//! - scaler: autoscaler
//! - dispatch: the Dispatcher front-end composing all of the above
//!
//! Every component runs as its own tokio task and owns its state; components
//! talk over mpsc/oneshot/watch channels only. There is no shared mutable
//! state, which is what makes the single-probe and single-outstanding-call
//! invariants cheap to uphold.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod pool;
pub mod ports;
pub mod queue;

pub(crate) mod scaler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    AutoScalingSettings, BackPressureSettings, CircuitBreakerSettings, DispatchHistorySettings,
    DispatcherSettings, RawConfig, WorkerPoolSettings,
};
pub use dispatch::{Dispatcher, EngineStatus};
pub use domain::{
    EnqueueOutcome, FailureReason, MetricEvent, RejectReason, ReplyAddress, WorkId, WorkItem,
    WorkOutcome, WorkReply,
};
pub use error::DispatchError;
pub use pool::{BreakerView, PoolSnapshot};
pub use ports::{
    Backend, Clock, EnvelopeChecker, FixedClock, FnBackend, FnChecker, LogSink, MetricsSink,
    NoopSink, ResultChecker, SystemClock,
};
pub use queue::QueueSnapshot;
