//! Bounded FIFO of pending work, run as its own task.
//!
//! Two variants share one mailbox protocol: the buffered queue (push mode,
//! with backpressure) and the pull-mode queue backed by a lazy sequence.
//! Workers never block inside the queue; `TryDispatch` answers immediately
//! and an empty answer is followed by condvar-style parking via `AwaitItem`.
//! A woken worker re-requests a dispatch permit from the processor before
//! asking again, which keeps the circuit-breaker gate race-free.

mod buffer;
mod history;
mod pull;

pub(crate) use buffer::spawn_buffered;
pub(crate) use pull::{spawn_pull, PullItemTemplate};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{EnqueueOutcome, WorkItem};
use crate::error::DispatchError;

/// Answer to a `TryDispatch`.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Item(WorkItem),

    /// Nothing right now; park on `AwaitItem` and ask again.
    Empty,

    /// Nothing will ever come again; the worker should retire.
    Drained,
}

pub(crate) enum QueueMsg {
    Enqueue {
        item: WorkItem,
        outcome_tx: oneshot::Sender<EnqueueOutcome>,
    },
    TryDispatch {
        reply_tx: oneshot::Sender<Dispatch>,
    },
    AwaitItem {
        wake_tx: oneshot::Sender<()>,
    },
    Snapshot {
        reply_tx: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown,
}

/// Sampled queue state, for the autoscaler and observers.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub len: usize,

    /// Items per second over the dispatch-history window; `None` until the
    /// window holds at least two samples.
    pub throughput: Option<f64>,

    pub shutting_down: bool,
    pub enqueued_total: u64,
    pub dispatched_total: u64,
    pub rejected_total: u64,
}

#[derive(Clone)]
pub(crate) struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueMsg>,
}

impl QueueHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<QueueMsg>) -> Self {
        Self { tx }
    }

    pub(crate) async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, DispatchError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::Enqueue { item, outcome_tx })
            .map_err(|_| DispatchError::QueueLost)?;
        outcome_rx.await.map_err(|_| DispatchError::QueueLost)
    }

    pub(crate) async fn try_dispatch(&self) -> Result<Dispatch, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::TryDispatch { reply_tx })
            .map_err(|_| DispatchError::QueueLost)?;
        reply_rx.await.map_err(|_| DispatchError::QueueLost)
    }

    /// Register for one wakeup on the next admission. The returned receiver
    /// resolves on wake, or errors if the queue goes away.
    pub(crate) fn await_item(&self) -> Result<oneshot::Receiver<()>, DispatchError> {
        let (wake_tx, wake_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::AwaitItem { wake_tx })
            .map_err(|_| DispatchError::QueueLost)?;
        Ok(wake_rx)
    }

    pub(crate) async fn snapshot(&self) -> Result<QueueSnapshot, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueMsg::Snapshot { reply_tx })
            .map_err(|_| DispatchError::QueueLost)?;
        reply_rx.await.map_err(|_| DispatchError::QueueLost)
    }

    /// Flip to shutting-down: further enqueues are rejected, dispatch keeps
    /// serving until empty. Fire-and-forget.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(QueueMsg::Shutdown);
    }
}
