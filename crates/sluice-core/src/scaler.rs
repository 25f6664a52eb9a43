//! Autoscaler: periodically samples queue and processor state and nudges the
//! pool size, one worker at a time.
//!
//! Resize requests are fire-and-forget; the scaler never blocks the
//! processor and terminates itself on the first sample that shows the
//! processor shutting down (or on either peer disappearing).

use std::collections::VecDeque;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::AutoScalingSettings;
use crate::pool::ProcessorHandle;
use crate::queue::QueueHandle;

/// Samples kept for policy evaluation.
const HISTORY_CAP: usize = 8;

/// Throughput within 5% of the previous sample still counts as flattened.
const FLAT_TOLERANCE: f64 = 1.05;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
    pub queue_len: usize,
    pub throughput: Option<f64>,
    pub pool_size: usize,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalingDecision {
    Hold,
    Grow,
    Shrink,
}

/// Pure policy over the sample history, newest last.
///
/// - Grow when backlogged, below max, error rate acceptable, and throughput
///   has flattened or declined since the previous sample (more workers are
///   not already paying off).
/// - Shrink when the trailing samples are all idle and the pool is above
///   min; the consecutive-sample requirement is the hysteresis.
pub(crate) fn evaluate(
    history: &VecDeque<Sample>,
    cfg: &AutoScalingSettings,
    min: usize,
    max: usize,
) -> ScalingDecision {
    let Some(latest) = history.back() else {
        return ScalingDecision::Hold;
    };

    if latest.queue_len > 0 {
        if history.len() < 2 || latest.pool_size >= max {
            return ScalingDecision::Hold;
        }
        if latest.error_rate > cfg.max_error_rate_for_growth {
            // Growth amplifies failure cost.
            return ScalingDecision::Hold;
        }
        let previous = &history[history.len() - 2];
        let improving = match (previous.throughput, latest.throughput) {
            (Some(prev), Some(now)) => now > prev * FLAT_TOLERANCE,
            // Unknown throughput with a standing backlog reads as stalled.
            _ => false,
        };
        if !improving {
            return ScalingDecision::Grow;
        }
        return ScalingDecision::Hold;
    }

    let needed = cfg
        .idle_samples_before_shrink
        .max(cfg.hysteresis_samples) as usize;
    if latest.pool_size > min
        && history.len() >= needed
        && history.iter().rev().take(needed).all(|s| s.queue_len == 0)
    {
        return ScalingDecision::Shrink;
    }

    ScalingDecision::Hold
}

pub(crate) fn spawn_scaler(
    cfg: AutoScalingSettings,
    min: usize,
    max: usize,
    queue: QueueHandle,
    processor: ProcessorHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(cfg.sampler_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut history: VecDeque<Sample> = VecDeque::new();

        loop {
            ticker.tick().await;
            let Ok(q) = queue.snapshot().await else { break };
            let Ok(p) = processor.snapshot().await else { break };
            if p.shutting_down {
                break;
            }

            history.push_back(Sample {
                queue_len: q.len,
                throughput: q.throughput,
                pool_size: p.pool_size,
                error_rate: p.error_rate,
            });
            if history.len() > HISTORY_CAP {
                history.pop_front();
            }

            match evaluate(&history, &cfg, min, max) {
                ScalingDecision::Grow => {
                    tracing::debug!(pool = p.pool_size, backlog = q.len, "scaling up");
                    processor.resize(p.pool_size + 1);
                }
                ScalingDecision::Shrink => {
                    tracing::debug!(pool = p.pool_size, "scaling down");
                    processor.resize(p.pool_size.saturating_sub(1));
                }
                ScalingDecision::Hold => {}
            }
        }
        tracing::debug!("autoscaler stopped");
    })
}
