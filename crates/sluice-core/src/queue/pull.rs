//! Pull-mode queue: the enqueue side is replaced by a lazy sequence.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{Dispatch, QueueHandle, QueueMsg, QueueSnapshot};
use crate::domain::{MetricEvent, ReplyAddress, WorkItem};
use crate::ports::MetricsSink;

/// How pulled values are wrapped into work items.
pub(crate) struct PullItemTemplate {
    pub timeout: std::time::Duration,
    pub retry_budget: u32,
    pub send_results_to: Option<ReplyAddress>,
}

/// Spawn the pull-mode queue task. `exhausted_tx` fires once, when the
/// sequence first runs dry; the dispatcher uses it to begin graceful
/// shutdown while workers finish what is already in flight.
pub(crate) fn spawn_pull(
    items: Box<dyn Iterator<Item = serde_json::Value> + Send>,
    template: PullItemTemplate,
    exhausted_tx: oneshot::Sender<()>,
    sink: Arc<dyn MetricsSink>,
) -> QueueHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = PullQueue {
        items,
        template,
        exhausted_tx: Some(exhausted_tx),
        shutting_down: false,
        dispatched_total: 0,
        sink,
    };
    tokio::spawn(state.run(rx));
    QueueHandle::new(tx)
}

struct PullQueue {
    items: Box<dyn Iterator<Item = serde_json::Value> + Send>,
    template: PullItemTemplate,

    /// `Some` until the sequence runs dry; taken when the signal fires.
    exhausted_tx: Option<oneshot::Sender<()>>,

    shutting_down: bool,
    dispatched_total: u64,
    sink: Arc<dyn MetricsSink>,
}

impl PullQueue {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                QueueMsg::Enqueue { .. } => {
                    // Enqueue has no meaning here; reaching this is a wiring
                    // bug, and a dead queue is the loudest possible answer.
                    panic!("enqueue on a pull-mode queue");
                }
                QueueMsg::TryDispatch { reply_tx } => {
                    let dispatch = self.pull_next();
                    let _ = reply_tx.send(dispatch);
                }
                QueueMsg::AwaitItem { wake_tx } => {
                    // A pull source is never "empty but alive": wake the
                    // worker immediately so it re-asks and sees Drained.
                    let _ = wake_tx.send(());
                }
                QueueMsg::Snapshot { reply_tx } => {
                    let exhausted = self.exhausted_tx.is_none();
                    let _ = reply_tx.send(QueueSnapshot {
                        len: 0,
                        throughput: None,
                        shutting_down: self.shutting_down || exhausted,
                        enqueued_total: self.dispatched_total,
                        dispatched_total: self.dispatched_total,
                        rejected_total: 0,
                    });
                }
                QueueMsg::Shutdown => {
                    self.shutting_down = true;
                }
            }
        }
    }

    fn pull_next(&mut self) -> Dispatch {
        if self.shutting_down || self.exhausted_tx.is_none() {
            return Dispatch::Drained;
        }
        match self.items.next() {
            Some(payload) => {
                let item = WorkItem::new(
                    payload,
                    self.template.send_results_to.clone(),
                    self.template.retry_budget,
                    self.template.timeout,
                );
                self.dispatched_total += 1;
                self.sink.record(MetricEvent::Enqueued);
                Dispatch::Item(item)
            }
            None => {
                if let Some(exhausted_tx) = self.exhausted_tx.take() {
                    tracing::debug!("pull source exhausted");
                    let _ = exhausted_tx.send(());
                }
                Dispatch::Drained
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NoopSink;
    use std::time::Duration;

    fn template() -> PullItemTemplate {
        PullItemTemplate {
            timeout: Duration::from_secs(5),
            retry_budget: 1,
            send_results_to: None,
        }
    }

    #[tokio::test]
    async fn pulls_in_sequence_order_then_drains() {
        let source = (0..3).map(|n| serde_json::json!({ "n": n }));
        let (exhausted_tx, exhausted_rx) = oneshot::channel();
        let queue = spawn_pull(
            Box::new(source),
            template(),
            exhausted_tx,
            Arc::new(NoopSink),
        );

        for n in 0..3 {
            match queue.try_dispatch().await.unwrap() {
                Dispatch::Item(item) => {
                    assert_eq!(item.payload["n"], n);
                    assert_eq!(item.retry_budget, 1);
                }
                other => panic!("expected item, got {other:?}"),
            }
        }
        assert!(matches!(queue.try_dispatch().await.unwrap(), Dispatch::Drained));
        exhausted_rx.await.expect("exhaustion signal fires");

        // Still drained on later asks; the signal fires only once.
        assert!(matches!(queue.try_dispatch().await.unwrap(), Dispatch::Drained));
    }

    #[tokio::test]
    async fn shutdown_stops_pulling_mid_sequence() {
        let source = (0..100).map(|n| serde_json::json!(n));
        let (exhausted_tx, _exhausted_rx) = oneshot::channel();
        let queue = spawn_pull(
            Box::new(source),
            template(),
            exhausted_tx,
            Arc::new(NoopSink),
        );

        assert!(matches!(queue.try_dispatch().await.unwrap(), Dispatch::Item(_)));
        queue.shutdown();
        assert!(matches!(queue.try_dispatch().await.unwrap(), Dispatch::Drained));
    }

    #[tokio::test]
    async fn await_item_wakes_immediately() {
        let (exhausted_tx, _exhausted_rx) = oneshot::channel();
        let queue = spawn_pull(
            Box::new(std::iter::empty()),
            template(),
            exhausted_tx,
            Arc::new(NoopSink),
        );
        let wake = queue.await_item().unwrap();
        tokio::time::timeout(Duration::from_millis(100), wake)
            .await
            .expect("wakes without an enqueue")
            .expect("queue alive");
    }
}
