//! Worker: single-slot executor.
//!
//! Pull one item, invoke the backend with the item's remaining deadline,
//! classify, retry or complete. Each worker is one task, so "at most one
//! outstanding backend call per worker" holds by construction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::{Permit, ProcessorHandle, RetireMode, WorkerExit};
use crate::domain::{FailureReason, MetricEvent, WorkItem, WorkOutcome, WorkReply};
use crate::ports::{Backend, MetricsSink, ResultChecker};
use crate::queue::{Dispatch, QueueHandle};

pub(crate) struct WorkerContext {
    pub worker_id: usize,
    pub queue: QueueHandle,
    pub processor: ProcessorHandle,
    pub backend: Arc<dyn Backend>,
    pub checker: Arc<dyn ResultChecker>,
    pub sink: Arc<dyn MetricsSink>,
    pub retire_rx: watch::Receiver<RetireMode>,
    pub max_processing_time: Option<Duration>,
}

enum ItemEnd {
    Done,
    ForcedExit,
}

pub(crate) async fn worker_loop(mut ctx: WorkerContext) -> WorkerExit {
    loop {
        if *ctx.retire_rx.borrow() != RetireMode::Active {
            return WorkerExit::Retired;
        }

        let permit = match ctx.processor.request_permit(ctx.worker_id).await {
            Ok(permit) => permit,
            // Processor gone: nobody is listening for a reason either.
            Err(_) => return WorkerExit::Retired,
        };

        match permit {
            Permit::BackOff { retry_after } => {
                tokio::select! {
                    _ = tokio::time::sleep(retry_after) => {}
                    _ = retire_changed(&mut ctx.retire_rx) => {}
                }
            }
            Permit::Granted { probe } => match ctx.queue.try_dispatch().await {
                Err(_) => {
                    if probe {
                        ctx.processor.release_probe(ctx.worker_id);
                    }
                    return WorkerExit::QueueLost;
                }
                Ok(Dispatch::Drained) => {
                    if probe {
                        ctx.processor.release_probe(ctx.worker_id);
                    }
                    return WorkerExit::Drained;
                }
                Ok(Dispatch::Empty) => {
                    if probe {
                        ctx.processor.release_probe(ctx.worker_id);
                    }
                    // Park until the next admission, then go back through the
                    // permit gate so an opened breaker is respected.
                    let wake = match ctx.queue.await_item() {
                        Ok(rx) => rx,
                        Err(_) => return WorkerExit::QueueLost,
                    };
                    tokio::select! {
                        _ = wake => {}
                        _ = retire_changed(&mut ctx.retire_rx) => {}
                    }
                }
                Ok(Dispatch::Item(item)) => {
                    ctx.processor.item_taken(ctx.worker_id);
                    let end = execute_item(&mut ctx, item, probe).await;
                    ctx.processor.item_finished(ctx.worker_id);
                    if matches!(end, ItemEnd::ForcedExit) {
                        return WorkerExit::Retired;
                    }
                }
            },
        }
    }
}

/// Run one item to its final outcome: attempt, classify, maybe retry.
///
/// Retries re-invoke the backend from this same worker, so FIFO order for
/// the other queued items is untouched. No attempt starts past the item's
/// deadline, and total invocations stay within `retry_budget + 1`.
async fn execute_item(ctx: &mut WorkerContext, item: WorkItem, probe: bool) -> ItemEnd {
    let WorkerContext {
        worker_id,
        processor,
        backend,
        checker,
        sink,
        retire_rx,
        max_processing_time,
        ..
    } = ctx;
    let worker_id = *worker_id;

    let started = Instant::now();
    sink.record(MetricEvent::WorkStarted);

    // The probe flag only describes the first attempt; once that outcome is
    // reported, the breaker has resolved the probe.
    let mut is_probe = probe;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let now = Instant::now();
        let remaining = item.remaining(now);
        if remaining.is_zero() {
            processor.attempt_outcome(worker_id, false, is_probe);
            sink.record(MetricEvent::WorkTimedOut);
            item.reply(WorkReply::Failed(FailureReason::TimedOut));
            return ItemEnd::Done;
        }
        let attempt_cap = match max_processing_time {
            Some(cap) => remaining.min(*cap),
            None => remaining,
        };
        // True when max_processing_time cut this attempt short of the item
        // deadline; only then can a timed-out attempt be retried.
        let attempt_was_capped = attempt_cap < remaining;

        let attempt_result = tokio::select! {
            res = tokio::time::timeout(attempt_cap, backend.call(&item.payload)) => res,
            _ = forced(retire_rx) => {
                tracing::warn!(id = %item.id, "abandoning in-flight item");
                sink.record(MetricEvent::WorkFailed { reason: "abandoned".into() });
                item.reply(WorkReply::Failed(FailureReason::Abandoned));
                return ItemEnd::ForcedExit;
            }
        };

        match attempt_result {
            Ok(Ok(raw)) => match checker.classify(raw) {
                WorkOutcome::Success(reply) => {
                    processor.attempt_outcome(worker_id, true, is_probe);
                    sink.record(MetricEvent::WorkCompleted {
                        duration: started.elapsed(),
                    });
                    item.reply(WorkReply::Completed(reply));
                    return ItemEnd::Done;
                }
                WorkOutcome::ApplicationFailure { reason, retryable } => {
                    processor.attempt_outcome(worker_id, false, is_probe);
                    is_probe = false;
                    sink.record(MetricEvent::WorkFailed {
                        reason: reason.clone(),
                    });
                    if retryable && may_retry(&item, attempt) {
                        tracing::debug!(id = %item.id, attempt, %reason, "retrying");
                        continue;
                    }
                    item.reply(WorkReply::Failed(FailureReason::Application(reason)));
                    return ItemEnd::Done;
                }
                WorkOutcome::Unrecognized(raw) => {
                    processor.attempt_outcome(worker_id, false, is_probe);
                    sink.record(MetricEvent::WorkFailed {
                        reason: "unrecognized reply".into(),
                    });
                    tracing::warn!(id = %item.id, %raw, "unrecognized backend reply");
                    item.reply(WorkReply::Failed(FailureReason::Unrecognized));
                    return ItemEnd::Done;
                }
            },
            // Transport-level failure: retryable application failure.
            Ok(Err(transport)) => {
                processor.attempt_outcome(worker_id, false, is_probe);
                is_probe = false;
                sink.record(MetricEvent::WorkFailed {
                    reason: transport.clone(),
                });
                if may_retry(&item, attempt) {
                    tracing::debug!(id = %item.id, attempt, error = %transport, "retrying");
                    continue;
                }
                item.reply(WorkReply::Failed(FailureReason::Application(transport)));
                return ItemEnd::Done;
            }
            // No reply within the attempt cap. Dropping the future cancels
            // the pending call. Retryable in principle, but unless
            // max_processing_time cut the attempt short, the deadline has
            // passed and this is final.
            Err(_elapsed) => {
                processor.attempt_outcome(worker_id, false, is_probe);
                is_probe = false;
                sink.record(MetricEvent::WorkTimedOut);
                if attempt_was_capped && may_retry(&item, attempt) {
                    tracing::debug!(id = %item.id, attempt, "attempt timed out, retrying");
                    continue;
                }
                item.reply(WorkReply::Failed(FailureReason::TimedOut));
                return ItemEnd::Done;
            }
        }
    }
}

fn may_retry(item: &WorkItem, attempt: u32) -> bool {
    attempt <= item.retry_budget && !item.remaining(Instant::now()).is_zero()
}

/// Resolves when any retire signal arrives (or the sender is gone).
async fn retire_changed(rx: &mut watch::Receiver<RetireMode>) {
    loop {
        if *rx.borrow_and_update() != RetireMode::Active {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves only on `Forced` (or a vanished sender, which means the
/// processor is gone and finishing cleanly is no longer possible).
async fn forced(rx: &mut watch::Receiver<RetireMode>) {
    loop {
        if *rx.borrow_and_update() == RetireMode::Forced {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
