//! Worker pool: the queue processor, its workers, and the circuit breaker.

mod breaker;
mod processor;
mod worker;

pub use breaker::BreakerView;
pub use processor::PoolSnapshot;

pub(crate) use processor::spawn_processor;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::DispatchError;

/// Answer to a worker's dispatch-permit request. The breaker gate is
/// evaluated centrally in the processor, which is what makes "at most one
/// probe while half-open" trivial to enforce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Permit {
    Granted { probe: bool },
    BackOff { retry_after: Duration },
}

/// Cooperative stop level, broadcast per worker over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireMode {
    Active,
    /// Finish the current item (if any), then exit.
    Graceful,
    /// Abandon the current item and exit now.
    Forced,
}

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    Retired,
    /// The queue reported it will never produce again.
    Drained,
    /// The queue task disappeared out from under us.
    QueueLost,
    /// The worker task panicked (reported by its monitor).
    Crashed,
}

pub(crate) enum ProcessorMsg {
    RequestPermit {
        worker_id: usize,
        reply_tx: oneshot::Sender<Permit>,
    },
    /// A probe grant went unused (no item to dispatch).
    ReleaseProbe { worker_id: usize },
    ItemTaken { worker_id: usize },
    AttemptOutcome {
        worker_id: usize,
        success: bool,
        probe: bool,
    },
    ItemFinished { worker_id: usize },
    WorkerExited { worker_id: usize, exit: WorkerExit },
    Resize { target: usize },
    Snapshot {
        reply_tx: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        report_back: oneshot::Sender<()>,
        timeout: Duration,
        graceful: bool,
    },
}

#[derive(Clone)]
pub(crate) struct ProcessorHandle {
    tx: mpsc::UnboundedSender<ProcessorMsg>,
}

impl ProcessorHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProcessorMsg>) -> Self {
        Self { tx }
    }

    pub(crate) async fn request_permit(&self, worker_id: usize) -> Result<Permit, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ProcessorMsg::RequestPermit { worker_id, reply_tx })
            .map_err(|_| DispatchError::ProcessorLost)?;
        reply_rx.await.map_err(|_| DispatchError::ProcessorLost)
    }

    pub(crate) fn release_probe(&self, worker_id: usize) {
        let _ = self.tx.send(ProcessorMsg::ReleaseProbe { worker_id });
    }

    pub(crate) fn item_taken(&self, worker_id: usize) {
        let _ = self.tx.send(ProcessorMsg::ItemTaken { worker_id });
    }

    pub(crate) fn attempt_outcome(&self, worker_id: usize, success: bool, probe: bool) {
        let _ = self.tx.send(ProcessorMsg::AttemptOutcome {
            worker_id,
            success,
            probe,
        });
    }

    pub(crate) fn item_finished(&self, worker_id: usize) {
        let _ = self.tx.send(ProcessorMsg::ItemFinished { worker_id });
    }

    /// Fire-and-forget; the processor clamps and settles on its own time.
    pub(crate) fn resize(&self, target: usize) {
        let _ = self.tx.send(ProcessorMsg::Resize { target });
    }

    pub(crate) async fn snapshot(&self) -> Result<PoolSnapshot, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ProcessorMsg::Snapshot { reply_tx })
            .map_err(|_| DispatchError::ProcessorLost)?;
        reply_rx.await.map_err(|_| DispatchError::ProcessorLost)
    }

    pub(crate) fn shutdown(
        &self,
        report_back: oneshot::Sender<()>,
        timeout: Duration,
        graceful: bool,
    ) {
        let _ = self.tx.send(ProcessorMsg::Shutdown {
            report_back,
            timeout,
            graceful,
        });
    }
}
