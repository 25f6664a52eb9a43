//! Demo: a push dispatcher over a flaky echo backend.
//!
//! Submits a burst of work, drains the replies, prints engine status, and
//! shuts down gracefully.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::unbounded_channel;

use sluice_core::{
    BackPressureSettings, CircuitBreakerSettings, Dispatcher, DispatcherSettings, EnvelopeChecker,
    FnBackend, LogSink, WorkReply,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Echo backend with a little latency; every 7th call fails retryably.
    let counter = Arc::new(AtomicU64::new(0));
    let backend = Arc::new(FnBackend::new(move |request: serde_json::Value| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let n = counter.fetch_add(1, Ordering::Relaxed);
            if n % 7 == 6 {
                return Ok(serde_json::json!({
                    "status": "error",
                    "reason": "simulated hiccup",
                    "retryable": true,
                }));
            }
            Ok(serde_json::json!({ "status": "ok", "reply": request }))
        }
    }));

    let settings = DispatcherSettings {
        work_timeout: Duration::from_secs(5),
        work_retry: 2,
        back_pressure: Some(BackPressureSettings {
            max_buffer_size: 1000,
            ..BackPressureSettings::default()
        }),
        circuit_breaker: Some(CircuitBreakerSettings::default()),
        ..DispatcherSettings::default()
    };

    let engine = Dispatcher::spawn(
        settings,
        backend,
        Arc::new(EnvelopeChecker),
        Arc::new(LogSink::new()),
    )
    .expect("settings are valid");

    let (reply_tx, mut reply_rx) = unbounded_channel();
    let total = 40u64;
    for n in 0..total {
        engine
            .submit(serde_json::json!({ "n": n }), Some(reply_tx.clone()))
            .expect("engine accepts submissions");
    }
    tracing::info!(total, "submitted");

    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut rejected = 0u64;
    for _ in 0..total {
        match reply_rx.recv().await {
            Some(WorkReply::Completed(_)) => completed += 1,
            Some(WorkReply::Failed(reason)) => {
                tracing::warn!(%reason, "item failed");
                failed += 1;
            }
            Some(WorkReply::Rejected(reason)) => {
                tracing::warn!(%reason, "item rejected");
                rejected += 1;
            }
            None => break,
        }
    }
    tracing::info!(completed, failed, rejected, "burst finished");

    let status = engine.status().await.expect("engine is running");
    tracing::info!(
        dispatched = status.queue.dispatched_total,
        pool = status.pool.pool_size,
        error_rate = status.pool.error_rate,
        "engine status"
    );

    engine
        .shutdown_gracefully(Duration::from_secs(10))
        .await
        .expect("graceful shutdown completes");
    tracing::info!("engine stopped");
}
