//! Dispatcher: the public entry point.
//!
//! Composes queue, processor, and (optionally) the autoscaler, and routes
//! producer input. Push mode accepts individual submissions; pull mode feeds
//! the engine from a lazy sequence and shuts down when it runs dry.
//!
//! Supervision is strictly downward-owned: the dispatcher owns the processor
//! and queue, the processor owns its workers. Processor termination, for any
//! reason, terminates the dispatcher and with it all children.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::DispatcherSettings;
use crate::domain::{EnqueueOutcome, RejectReason, ReplyAddress, WorkItem, WorkReply};
use crate::error::DispatchError;
use crate::pool::{spawn_processor, PoolSnapshot, ProcessorHandle};
use crate::ports::{Backend, MetricsSink, ResultChecker};
use crate::queue::{spawn_buffered, spawn_pull, PullItemTemplate, QueueHandle, QueueSnapshot};
use crate::scaler::spawn_scaler;

/// Combined engine observability view.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub queue: QueueSnapshot,
    pub pool: PoolSnapshot,
}

enum DispatcherMsg {
    Submit {
        payload: serde_json::Value,
        reply_to: Option<ReplyAddress>,
    },
    Status {
        reply_tx: oneshot::Sender<EngineStatus>,
    },
    ShutdownGracefully {
        report_back: oneshot::Sender<()>,
        timeout: Duration,
    },
    /// Pull mode only: the source sequence ran dry.
    SequenceComplete,
}

/// Handle to a running dispatch engine. Cheap to clone; producers submit
/// through it, the administrative surface shuts it down.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    terminated_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Start a push-mode engine. Fatal on invalid settings.
    pub fn spawn(
        settings: DispatcherSettings,
        backend: Arc<dyn Backend>,
        checker: Arc<dyn ResultChecker>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, DispatchError> {
        settings.validate()?;
        let queue = spawn_buffered(
            settings.back_pressure.clone(),
            settings.history_window(),
            Arc::clone(&sink),
        );
        Ok(Self::assemble(settings, queue, None, backend, checker, sink))
    }

    /// Start a pull-mode engine around a lazy item sequence. Outcomes go to
    /// `send_results_to` (if any); completion of the sequence triggers a
    /// graceful shutdown of the whole engine.
    pub fn spawn_pull(
        settings: DispatcherSettings,
        backend: Arc<dyn Backend>,
        checker: Arc<dyn ResultChecker>,
        sink: Arc<dyn MetricsSink>,
        items: impl Iterator<Item = serde_json::Value> + Send + 'static,
        send_results_to: Option<ReplyAddress>,
    ) -> Result<Self, DispatchError> {
        settings.validate()?;
        let (exhausted_tx, exhausted_rx) = oneshot::channel();
        let queue = spawn_pull(
            Box::new(items),
            PullItemTemplate {
                timeout: settings.work_timeout,
                retry_budget: settings.work_retry,
                send_results_to,
            },
            exhausted_tx,
            Arc::clone(&sink),
        );
        Ok(Self::assemble(
            settings,
            queue,
            Some(exhausted_rx),
            backend,
            checker,
            sink,
        ))
    }

    fn assemble(
        settings: DispatcherSettings,
        queue: QueueHandle,
        exhausted: Option<oneshot::Receiver<()>>,
        backend: Arc<dyn Backend>,
        checker: Arc<dyn ResultChecker>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let (processor, processor_join) =
            spawn_processor(&settings, queue.clone(), backend, checker, sink);
        let scaler_join = settings.auto_scaling.clone().map(|cfg| {
            spawn_scaler(
                cfg,
                settings.worker_pool.min_pool_size,
                settings.worker_pool.max_pool_size,
                queue.clone(),
                processor.clone(),
            )
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = watch::channel(false);

        if let Some(exhausted_rx) = exhausted {
            let tx = tx.clone();
            tokio::spawn(async move {
                if exhausted_rx.await.is_ok() {
                    let _ = tx.send(DispatcherMsg::SequenceComplete);
                }
            });
        }

        tokio::spawn(run_dispatcher(
            rx,
            queue,
            processor,
            processor_join,
            scaler_join,
            settings.work_timeout,
            settings.work_retry,
            terminated_tx,
        ));

        Self { tx, terminated_rx }
    }

    /// Submit one work item. The outcome arrives on `reply_to`: nothing now
    /// and the backend reply later, or a synchronous-ish `Rejected`.
    pub fn submit(
        &self,
        payload: serde_json::Value,
        reply_to: Option<ReplyAddress>,
    ) -> Result<(), DispatchError> {
        self.tx
            .send(DispatcherMsg::Submit { payload, reply_to })
            .map_err(|_| DispatchError::Terminated)
    }

    pub async fn status(&self) -> Result<EngineStatus, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::Status { reply_tx })
            .map_err(|_| DispatchError::Terminated)?;
        reply_rx.await.map_err(|_| DispatchError::Terminated)
    }

    /// Drain and stop, bounded by `timeout`. Resolves when the engine has
    /// fully terminated; every caller gets exactly one completion.
    pub async fn shutdown_gracefully(&self, timeout: Duration) -> Result<(), DispatchError> {
        let (report_back, report_rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::ShutdownGracefully {
                report_back,
                timeout,
            })
            .map_err(|_| DispatchError::Terminated)?;
        report_rx.await.map_err(|_| DispatchError::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated_rx.borrow()
    }

    /// Resolves once the engine has fully terminated.
    pub async fn wait_terminated(&self) {
        let mut rx = self.terminated_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn reject_text(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::OverCapacity => "Server is at capacity",
        RejectReason::ShuttingDown => "Shutting down",
        RejectReason::Expired => "Expired",
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    queue: QueueHandle,
    processor: ProcessorHandle,
    mut processor_join: JoinHandle<()>,
    scaler_join: Option<JoinHandle<()>>,
    work_timeout: Duration,
    work_retry: u32,
    terminated_tx: watch::Sender<bool>,
) {
    let mut shutting_down = false;
    let mut pending_reports: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                None => {
                    // Every handle is gone: stop the engine outright.
                    tracing::debug!("dispatcher handle dropped, stopping engine");
                    let (ack_tx, _ack_rx) = oneshot::channel();
                    processor.shutdown(ack_tx, Duration::ZERO, false);
                    let _ = (&mut processor_join).await;
                    break;
                }
                Some(DispatcherMsg::Submit { payload, reply_to }) => {
                    if shutting_down {
                        if let Some(tx) = &reply_to {
                            let _ = tx.send(WorkReply::Rejected("Shutting down".into()));
                        }
                        continue;
                    }
                    let item = WorkItem::new(payload, reply_to.clone(), work_retry, work_timeout);
                    match queue.enqueue(item).await {
                        Ok(EnqueueOutcome::Enqueued) => {
                            // No acknowledgement; the eventual backend reply
                            // is the response.
                        }
                        Ok(EnqueueOutcome::Rejected(reason)) => {
                            if let Some(tx) = &reply_to {
                                let _ = tx.send(WorkReply::Rejected(reject_text(reason).into()));
                            }
                        }
                        Err(_) => {
                            // Queue gone; the processor is about to notice
                            // and take everything down.
                            if let Some(tx) = &reply_to {
                                let _ = tx.send(WorkReply::Rejected("Shutting down".into()));
                            }
                        }
                    }
                }
                Some(DispatcherMsg::Status { reply_tx }) => {
                    let queue_snapshot = queue.snapshot().await;
                    let pool_snapshot = processor.snapshot().await;
                    if let (Ok(queue), Ok(pool)) = (queue_snapshot, pool_snapshot) {
                        let _ = reply_tx.send(EngineStatus { queue, pool });
                    }
                }
                Some(DispatcherMsg::ShutdownGracefully { report_back, timeout }) => {
                    pending_reports.push(report_back);
                    if !shutting_down {
                        shutting_down = true;
                        tracing::info!(?timeout, "graceful shutdown requested");
                        queue.shutdown();
                        let (ack_tx, _ack_rx) = oneshot::channel();
                        processor.shutdown(ack_tx, timeout, true);
                    }
                }
                Some(DispatcherMsg::SequenceComplete) => {
                    if !shutting_down {
                        shutting_down = true;
                        tracing::info!("pull sequence complete, shutting down");
                        queue.shutdown();
                        let (ack_tx, _ack_rx) = oneshot::channel();
                        processor.shutdown(ack_tx, work_timeout, true);
                    }
                }
            },
            _ = &mut processor_join => {
                // Processor termination, clean or not, ends the dispatcher.
                tracing::debug!("processor terminated, dispatcher following");
                break;
            }
        }
    }

    for report in pending_reports.drain(..) {
        let _ = report.send(());
    }
    if let Some(scaler) = scaler_join {
        scaler.abort();
    }
    let _ = terminated_tx.send(true);
    tracing::debug!("dispatcher stopped");
}
