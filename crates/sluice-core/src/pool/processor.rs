//! Queue processor: owns a dynamic set of workers and gates their dispatch
//! through the (optional) circuit breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::breaker::{BreakerEvent, BreakerView, CircuitBreaker, Gate};
use super::worker::{worker_loop, WorkerContext};
use super::{Permit, ProcessorHandle, ProcessorMsg, RetireMode, WorkerExit};
use crate::config::DispatcherSettings;
use crate::domain::MetricEvent;
use crate::ports::{Backend, MetricsSink, ResultChecker};
use crate::queue::QueueHandle;

/// Outcome window size for the snapshot error rate when no breaker is
/// configured.
const DEFAULT_OUTCOME_WINDOW: usize = 16;

/// Sampled processor state, for the autoscaler and observers.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Workers not currently retiring.
    pub pool_size: usize,

    /// Workers with an item in flight.
    pub busy: usize,

    /// Failure share over the recent-outcome window; 0.0 while empty.
    pub error_rate: f64,

    pub breaker: BreakerView,
    pub shutting_down: bool,
}

pub(crate) fn spawn_processor(
    settings: &DispatcherSettings,
    queue: QueueHandle,
    backend: Arc<dyn Backend>,
    checker: Arc<dyn ResultChecker>,
    sink: Arc<dyn MetricsSink>,
) -> (ProcessorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = &settings.worker_pool;
    let recent_cap = settings
        .circuit_breaker
        .as_ref()
        .map(|cb| cb.history_length)
        .unwrap_or(DEFAULT_OUTCOME_WINDOW);

    let mut processor = Processor {
        self_tx: tx.clone(),
        workers: HashMap::new(),
        next_worker_id: 0,
        breaker: settings
            .circuit_breaker
            .clone()
            .map(CircuitBreaker::new),
        probe_worker: None,
        recent: VecDeque::new(),
        recent_cap,
        min: pool.min_pool_size,
        max: pool.max_pool_size,
        max_processing_time: pool.max_processing_time,
        queue,
        backend,
        checker,
        sink,
        shutdown: None,
        acks: Vec::new(),
        queue_lost: false,
    };

    let initial = pool
        .starting_pool_size
        .clamp(pool.min_pool_size, pool.max_pool_size);
    for _ in 0..initial {
        processor.spawn_worker();
    }
    tracing::debug!(initial, "processor started");

    let join = tokio::spawn(processor.run(rx));
    (ProcessorHandle::new(tx), join)
}

struct WorkerSlot {
    retire_tx: watch::Sender<RetireMode>,
    busy: bool,
    retiring: bool,
    spawned_at: Instant,
}

struct ShutdownPhase {
    deadline: Instant,
    forced: bool,
}

struct Processor {
    self_tx: mpsc::UnboundedSender<ProcessorMsg>,
    workers: HashMap<usize, WorkerSlot>,
    next_worker_id: usize,

    breaker: Option<CircuitBreaker>,
    /// Worker currently holding the half-open probe grant.
    probe_worker: Option<usize>,

    /// Recent attempt outcomes (`true` = success) backing the snapshot
    /// error rate.
    recent: VecDeque<bool>,
    recent_cap: usize,

    min: usize,
    max: usize,
    max_processing_time: Option<Duration>,

    queue: QueueHandle,
    backend: Arc<dyn Backend>,
    checker: Arc<dyn ResultChecker>,
    sink: Arc<dyn MetricsSink>,

    shutdown: Option<ShutdownPhase>,
    acks: Vec<oneshot::Sender<()>>,
    queue_lost: bool,
}

impl Processor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProcessorMsg>) {
        loop {
            let force_deadline = self
                .shutdown
                .as_ref()
                .filter(|phase| !phase.forced)
                .map(|phase| phase.deadline);
            let force_timer = async {
                match force_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = force_timer => {
                    tracing::warn!("drain timeout elapsed, hard-stopping workers");
                    self.force_all();
                }
            }

            if self.shutdown.is_some() && self.workers.is_empty() {
                for ack in self.acks.drain(..) {
                    let _ = ack.send(());
                }
                tracing::debug!("processor stopped");
                break;
            }
            if self.queue_lost {
                // Structural: a lost queue takes the processor down with it.
                break;
            }
        }
    }

    fn handle(&mut self, msg: ProcessorMsg) {
        match msg {
            ProcessorMsg::RequestPermit { worker_id, reply_tx } => {
                let permit = self.gate(worker_id);
                let _ = reply_tx.send(permit);
            }
            ProcessorMsg::ReleaseProbe { worker_id } => {
                if self.probe_worker == Some(worker_id) {
                    self.probe_worker = None;
                    if let Some(breaker) = &mut self.breaker {
                        breaker.release_probe();
                    }
                }
            }
            ProcessorMsg::ItemTaken { worker_id } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.busy = true;
                }
            }
            ProcessorMsg::AttemptOutcome {
                worker_id,
                success,
                probe,
            } => self.record_outcome(worker_id, success, probe),
            ProcessorMsg::ItemFinished { worker_id } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.busy = false;
                }
            }
            ProcessorMsg::WorkerExited { worker_id, exit } => {
                self.worker_exited(worker_id, exit)
            }
            ProcessorMsg::Resize { target } => {
                if self.shutdown.is_none() {
                    self.resize(target);
                }
            }
            ProcessorMsg::Snapshot { reply_tx } => {
                let _ = reply_tx.send(self.snapshot());
            }
            ProcessorMsg::Shutdown {
                report_back,
                timeout,
                graceful,
            } => {
                self.acks.push(report_back);
                if self.shutdown.is_none() {
                    tracing::info!(graceful, ?timeout, "processor shutting down");
                    self.shutdown = Some(ShutdownPhase {
                        deadline: Instant::now() + timeout,
                        forced: false,
                    });
                    if graceful {
                        // Workers drain the queue and exit on Drained; the
                        // deadline above hard-stops whatever is left.
                    } else {
                        self.force_all();
                    }
                }
            }
        }
    }

    /// Central breaker gate. While open, nothing is pulled from the queue;
    /// while half-open, exactly one probe dispatch is out at a time.
    fn gate(&mut self, worker_id: usize) -> Permit {
        match &mut self.breaker {
            None => Permit::Granted { probe: false },
            Some(breaker) => match breaker.admit(Instant::now()) {
                Gate::Pass => Permit::Granted { probe: false },
                Gate::Probe => {
                    self.probe_worker = Some(worker_id);
                    Permit::Granted { probe: true }
                }
                Gate::Hold { retry_after } => Permit::BackOff { retry_after },
            },
        }
    }

    fn record_outcome(&mut self, worker_id: usize, success: bool, probe: bool) {
        self.recent.push_back(success);
        if self.recent.len() > self.recent_cap {
            self.recent.pop_front();
        }
        if probe && self.probe_worker == Some(worker_id) {
            self.probe_worker = None;
        }
        if let Some(breaker) = &mut self.breaker {
            match breaker.on_outcome(success, probe, Instant::now()) {
                Some(BreakerEvent::Opened) => {
                    tracing::warn!("circuit breaker opened");
                    self.sink.record(MetricEvent::CircuitBreakerOpened);
                }
                Some(BreakerEvent::Closed) => {
                    tracing::info!("circuit breaker closed");
                    self.sink.record(MetricEvent::CircuitBreakerClosed);
                }
                None => {}
            }
        }
    }

    fn worker_exited(&mut self, worker_id: usize, exit: WorkerExit) {
        let slot = self.workers.remove(&worker_id);
        if self.probe_worker == Some(worker_id) {
            self.probe_worker = None;
            if let Some(breaker) = &mut self.breaker {
                breaker.release_probe();
            }
        }
        match exit {
            WorkerExit::Crashed => {
                tracing::warn!(worker_id, "worker crashed");
                let was_retiring = slot.map(|s| s.retiring).unwrap_or(false);
                if self.shutdown.is_none() && !was_retiring {
                    // Replace to maintain pool size.
                    self.spawn_worker();
                }
            }
            WorkerExit::QueueLost => {
                if self.shutdown.is_none() {
                    tracing::error!("queue lost, terminating processor");
                    self.queue_lost = true;
                }
            }
            WorkerExit::Retired | WorkerExit::Drained => {}
        }
    }

    fn resize(&mut self, target: usize) {
        let target = target.clamp(self.min, self.max);
        let mut active: Vec<(usize, bool, Instant)> = self
            .workers
            .iter()
            .filter(|(_, slot)| !slot.retiring)
            .map(|(id, slot)| (*id, slot.busy, slot.spawned_at))
            .collect();
        let current = active.len();
        if target == current {
            return;
        }

        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
        } else {
            // Retire idle workers first, oldest first among ties.
            active.sort_by_key(|(_, busy, spawned_at)| (*busy, *spawned_at));
            for (id, _, _) in active.into_iter().take(current - target) {
                if let Some(slot) = self.workers.get_mut(&id) {
                    slot.retiring = true;
                    let _ = slot.retire_tx.send(RetireMode::Graceful);
                }
            }
        }

        tracing::info!(from = current, to = target, "pool resized");
        self.sink.record(MetricEvent::PoolResized {
            from: current,
            to: target,
        });
    }

    fn spawn_worker(&mut self) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let (retire_tx, retire_rx) = watch::channel(RetireMode::Active);
        let ctx = WorkerContext {
            worker_id,
            queue: self.queue.clone(),
            processor: ProcessorHandle::new(self.self_tx.clone()),
            backend: Arc::clone(&self.backend),
            checker: Arc::clone(&self.checker),
            sink: Arc::clone(&self.sink),
            retire_rx,
            max_processing_time: self.max_processing_time,
        };
        let join = tokio::spawn(worker_loop(ctx));

        // The monitor is what makes crashes visible: a panicked worker is
        // reported just like a clean exit, so it can be replaced.
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let exit = match join.await {
                Ok(exit) => exit,
                Err(_) => WorkerExit::Crashed,
            };
            let _ = self_tx.send(ProcessorMsg::WorkerExited { worker_id, exit });
        });

        self.workers.insert(
            worker_id,
            WorkerSlot {
                retire_tx,
                busy: false,
                retiring: false,
                spawned_at: Instant::now(),
            },
        );
    }

    fn force_all(&mut self) {
        if let Some(phase) = &mut self.shutdown {
            phase.forced = true;
        }
        for slot in self.workers.values_mut() {
            slot.retiring = true;
            let _ = slot.retire_tx.send(RetireMode::Forced);
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let pool_size = self.workers.values().filter(|s| !s.retiring).count();
        let busy = self.workers.values().filter(|s| s.busy).count();
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        let error_rate = if self.recent.is_empty() {
            0.0
        } else {
            failures as f64 / self.recent.len() as f64
        };
        PoolSnapshot {
            pool_size,
            busy,
            error_rate,
            breaker: self
                .breaker
                .as_ref()
                .map(|b| b.view())
                .unwrap_or(BreakerView::Disabled),
            shutting_down: self.shutdown.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerSettings, WorkerPoolSettings};
    use crate::ports::{EnvelopeChecker, NoopSink};
    use crate::queue::spawn_buffered;
    use crate::testing::{RecordingSink, ScriptedBackend};
    use crate::domain::WorkItem;

    fn settings(starting: usize, min: usize, max: usize) -> DispatcherSettings {
        DispatcherSettings {
            worker_pool: WorkerPoolSettings {
                starting_pool_size: starting,
                min_pool_size: min,
                max_pool_size: max,
                max_processing_time: None,
            },
            ..DispatcherSettings::default()
        }
    }

    fn item(n: u64) -> WorkItem {
        WorkItem::new(
            serde_json::json!({ "n": n }),
            None,
            0,
            Duration::from_secs(30),
        )
    }

    async fn wait_for_pool_size(processor: &ProcessorHandle, expected: usize) {
        for _ in 0..100 {
            if processor.snapshot().await.unwrap().pool_size == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pool did not settle at {expected} in time");
    }

    async fn wait_for_dispatched(queue: &QueueHandle, expected: u64) {
        for _ in 0..100 {
            if queue.snapshot().await.unwrap().dispatched_total >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue did not dispatch {expected} items in time");
    }

    #[tokio::test]
    async fn starting_size_is_clamped_and_visible() {
        let queue = spawn_buffered(None, Duration::from_secs(10), Arc::new(NoopSink));
        let (processor, _join) = spawn_processor(
            &settings(100, 1, 3),
            queue,
            Arc::new(ScriptedBackend::failing(0)),
            Arc::new(EnvelopeChecker),
            Arc::new(NoopSink),
        );
        let snap = processor.snapshot().await.unwrap();
        assert_eq!(snap.pool_size, 3);
        assert_eq!(snap.breaker, BreakerView::Disabled);
    }

    #[tokio::test]
    async fn resize_grows_and_shrinks_within_bounds() {
        let queue = spawn_buffered(None, Duration::from_secs(10), Arc::new(NoopSink));
        let sink = Arc::new(RecordingSink::new());
        let (processor, _join) = spawn_processor(
            &settings(1, 1, 4),
            queue,
            Arc::new(ScriptedBackend::failing(0)),
            Arc::new(EnvelopeChecker),
            sink.clone(),
        );

        processor.resize(3);
        wait_for_pool_size(&processor, 3).await;

        processor.resize(10); // clamped to max
        wait_for_pool_size(&processor, 4).await;

        processor.resize(1);
        wait_for_pool_size(&processor, 1).await;

        assert!(sink.count(|e| matches!(e, MetricEvent::PoolResized { .. })) >= 3);
    }

    #[tokio::test]
    async fn workers_drain_queue_and_graceful_shutdown_reports_once() {
        let queue = spawn_buffered(None, Duration::from_secs(10), Arc::new(NoopSink));
        let (processor, join) = spawn_processor(
            &settings(2, 1, 4),
            queue.clone(),
            Arc::new(ScriptedBackend::failing(0)),
            Arc::new(EnvelopeChecker),
            Arc::new(NoopSink),
        );

        for n in 0..6 {
            queue.enqueue(item(n)).await.unwrap();
        }
        wait_for_dispatched(&queue, 6).await;

        queue.shutdown();
        let (ack_tx, ack_rx) = oneshot::channel();
        processor.shutdown(ack_tx, Duration::from_secs(5), true);
        tokio::time::timeout(Duration::from_secs(5), ack_rx)
            .await
            .expect("completion within the drain timeout")
            .expect("ack delivered");
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("processor task ends")
            .unwrap();
    }

    #[tokio::test]
    async fn crashed_worker_is_replaced() {
        struct PanickingOnce {
            panicked: std::sync::atomic::AtomicBool,
        }
        #[async_trait::async_trait]
        impl crate::ports::Backend for PanickingOnce {
            async fn call(
                &self,
                request: &serde_json::Value,
            ) -> Result<serde_json::Value, String> {
                if !self.panicked.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    panic!("injected worker crash");
                }
                Ok(serde_json::json!({"status": "ok", "reply": request}))
            }
        }

        let queue = spawn_buffered(None, Duration::from_secs(10), Arc::new(NoopSink));
        let (processor, _join) = spawn_processor(
            &settings(1, 1, 2),
            queue.clone(),
            Arc::new(PanickingOnce {
                panicked: std::sync::atomic::AtomicBool::new(false),
            }),
            Arc::new(EnvelopeChecker),
            Arc::new(NoopSink),
        );

        queue.enqueue(item(0)).await.unwrap();
        wait_for_dispatched(&queue, 1).await;

        // The panic killed the first worker; the replacement must pick up
        // the next item.
        wait_for_pool_size(&processor, 1).await;
        queue.enqueue(item(1)).await.unwrap();
        wait_for_dispatched(&queue, 2).await;
    }

    #[tokio::test]
    async fn breaker_trip_halts_dispatch_until_probe() {
        let mut settings = settings(1, 1, 1);
        settings.circuit_breaker = Some(CircuitBreakerSettings {
            close_duration: Duration::from_millis(300),
            error_rate_threshold: 0.6,
            history_length: 5,
        });

        let queue = spawn_buffered(None, Duration::from_secs(10), Arc::new(NoopSink));
        let sink = Arc::new(RecordingSink::new());
        // Five failures trip the breaker; the sixth call (the probe)
        // succeeds.
        let (processor, _join) = spawn_processor(
            &settings,
            queue.clone(),
            Arc::new(ScriptedBackend::failing(5)),
            Arc::new(EnvelopeChecker),
            sink.clone(),
        );

        for n in 0..5 {
            queue.enqueue(item(n)).await.unwrap();
        }
        for _ in 0..100 {
            if processor.snapshot().await.unwrap().breaker == BreakerView::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(processor.snapshot().await.unwrap().breaker, BreakerView::Open);
        assert_eq!(sink.count(|e| matches!(e, MetricEvent::CircuitBreakerOpened)), 1);

        // Enqueued while open: accepted but not dispatched.
        queue.enqueue(item(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.snapshot().await.unwrap().len, 1);

        // After close_duration the single probe dispatches it and closes the
        // breaker.
        for _ in 0..100 {
            if processor.snapshot().await.unwrap().breaker == BreakerView::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(processor.snapshot().await.unwrap().breaker, BreakerView::Closed);
        assert_eq!(sink.count(|e| matches!(e, MetricEvent::CircuitBreakerClosed)), 1);
        assert_eq!(queue.snapshot().await.unwrap().len, 0);
    }
}
