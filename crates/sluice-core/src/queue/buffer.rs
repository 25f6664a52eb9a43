//! Buffered (push-mode) queue actor.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::history::DispatchHistory;
use super::{Dispatch, QueueHandle, QueueMsg, QueueSnapshot};
use crate::config::BackPressureSettings;
use crate::domain::{
    EnqueueOutcome, FailureReason, MetricEvent, RejectReason, WorkItem, WorkReply,
};
use crate::ports::MetricsSink;

/// Spawn the buffered queue task and return its handle. The task ends when
/// every handle clone is gone; leftover items are abandoned with a failure
/// envelope at that point.
pub(crate) fn spawn_buffered(
    back_pressure: Option<BackPressureSettings>,
    history_window: std::time::Duration,
    sink: Arc<dyn MetricsSink>,
) -> QueueHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = BufferedQueue {
        buf: VecDeque::new(),
        history: DispatchHistory::new(history_window),
        back_pressure,
        waiters: Vec::new(),
        shutting_down: false,
        enqueued_total: 0,
        dispatched_total: 0,
        rejected_total: 0,
        sink,
    };
    tokio::spawn(state.run(rx));
    QueueHandle::new(tx)
}

struct BufferedQueue {
    buf: VecDeque<WorkItem>,
    history: DispatchHistory,
    back_pressure: Option<BackPressureSettings>,

    /// Parked workers, woken in bulk on the next admission.
    waiters: Vec<oneshot::Sender<()>>,

    shutting_down: bool,
    enqueued_total: u64,
    dispatched_total: u64,
    rejected_total: u64,
    sink: Arc<dyn MetricsSink>,
}

impl BufferedQueue {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                QueueMsg::Enqueue { item, outcome_tx } => {
                    let outcome = self.admit(item);
                    let _ = outcome_tx.send(outcome);
                }
                QueueMsg::TryDispatch { reply_tx } => {
                    let dispatch = self.dispatch_next();
                    let _ = reply_tx.send(dispatch);
                }
                QueueMsg::AwaitItem { wake_tx } => {
                    if self.buf.is_empty() && !self.shutting_down {
                        self.waiters.push(wake_tx);
                    } else {
                        let _ = wake_tx.send(());
                    }
                }
                QueueMsg::Snapshot { reply_tx } => {
                    let snapshot = self.snapshot();
                    let _ = reply_tx.send(snapshot);
                }
                QueueMsg::Shutdown => {
                    self.shutting_down = true;
                    self.wake_all();
                }
            }
        }

        // Every handle is gone: nobody can drain us anymore. Tell the
        // producers that are still listening.
        for item in self.buf.drain(..) {
            item.reply(WorkReply::Failed(FailureReason::Abandoned));
        }
    }

    fn admit(&mut self, item: WorkItem) -> EnqueueOutcome {
        let now = Instant::now();
        if self.shutting_down {
            return self.reject(RejectReason::ShuttingDown);
        }
        if item.is_expired(now) {
            return self.reject(RejectReason::Expired);
        }
        if let Some(bp) = &self.back_pressure {
            if self.buf.len() >= bp.max_buffer_size {
                return self.reject(RejectReason::OverCapacity);
            }
            // Expected wait = len / throughput. Unknown throughput (< 2
            // samples in the window) bypasses the check.
            if let Some(throughput) = self.history.throughput(now) {
                let expected_wait = self.buf.len() as f64 / throughput;
                if expected_wait > bp.threshold_for_expected_wait_time.as_secs_f64() {
                    return self.reject(RejectReason::OverCapacity);
                }
            }
        }

        self.buf.push_back(item);
        self.enqueued_total += 1;
        self.sink.record(MetricEvent::Enqueued);
        self.wake_all();
        EnqueueOutcome::Enqueued
    }

    fn reject(&mut self, reason: RejectReason) -> EnqueueOutcome {
        self.rejected_total += 1;
        self.sink.record(MetricEvent::EnqueueRejected(reason));
        EnqueueOutcome::Rejected(reason)
    }

    fn dispatch_next(&mut self) -> Dispatch {
        let now = Instant::now();

        // Drop expired head items. Side-effect only: survivors keep order.
        while self.buf.front().is_some_and(|head| head.is_expired(now)) {
            if let Some(expired) = self.buf.pop_front() {
                tracing::debug!(id = %expired.id, "dropping expired item");
                expired.reply(WorkReply::Failed(FailureReason::TimedOut));
                self.sink.record(MetricEvent::WorkFailed {
                    reason: "expired in queue".into(),
                });
            }
        }

        match self.buf.pop_front() {
            Some(item) => {
                self.history.record(now);
                self.dispatched_total += 1;
                Dispatch::Item(item)
            }
            None if self.shutting_down => Dispatch::Drained,
            None => Dispatch::Empty,
        }
    }

    fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn snapshot(&mut self) -> QueueSnapshot {
        QueueSnapshot {
            len: self.buf.len(),
            throughput: self.history.throughput(Instant::now()),
            shutting_down: self.shutting_down,
            enqueued_total: self.enqueued_total,
            dispatched_total: self.dispatched_total,
            rejected_total: self.rejected_total,
        }
    }
}
