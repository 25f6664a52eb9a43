//! Shared test doubles: a scripted backend and a recording sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::MetricEvent;
use crate::ports::{Backend, MetricsSink};

/// Backend that fails the first `n` calls with a retryable error envelope,
/// then succeeds, echoing the request. Optional per-call latency.
pub(crate) struct ScriptedBackend {
    remaining_failures: AtomicU32,
    latency: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub(crate) fn failing(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
            latency: None,
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn slow(latency: Duration) -> Self {
        Self {
            remaining_failures: AtomicU32::new(0),
            latency: Some(latency),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Ok(serde_json::json!({
                "status": "error",
                "reason": format!("intentional failure (left={left})"),
                "retryable": true,
            }));
        }
        Ok(serde_json::json!({"status": "ok", "reply": request}))
    }
}

/// Backend that never replies; calls hang until the caller's deadline cuts
/// them off.
pub(crate) struct SilentBackend {
    calls: AtomicU32,
}

impl SilentBackend {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for SilentBackend {
    async fn call(&self, _request: &serde_json::Value) -> Result<serde_json::Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Sink that stores every event for later assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count<F: Fn(&MetricEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl MetricsSink for RecordingSink {
    fn record(&self, event: MetricEvent) {
        self.events.lock().unwrap().push(event);
    }
}
