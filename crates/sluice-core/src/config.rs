//! Dispatcher settings.
//!
//! Two shapes: the validated [`DispatcherSettings`] record the engine runs
//! on, and [`RawConfig`], a serde-friendly external shape with per-block
//! `enabled` flags. Construction goes through [`DispatcherSettings::validate`]
//! either way; configuration errors are fatal to dispatcher creation.

use serde::Deserialize;
use std::time::Duration;

use crate::error::DispatchError;

/// Immutable settings record for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Deadline per work item, measured from accept.
    pub work_timeout: Duration,

    /// Retry budget per item (extra backend invocations beyond the first).
    pub work_retry: u32,

    pub dispatch_history: DispatchHistorySettings,
    pub worker_pool: WorkerPoolSettings,

    /// Active only when present; same for the two blocks below.
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    pub back_pressure: Option<BackPressureSettings>,
    pub auto_scaling: Option<AutoScalingSettings>,
}

#[derive(Debug, Clone)]
pub struct DispatchHistorySettings {
    /// Window over which recent dispatch timestamps are kept for throughput
    /// estimation.
    pub max_history_length: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    pub starting_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,

    /// Cap on a single backend attempt, below the item deadline.
    pub max_processing_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// How long the breaker stays open before probing.
    pub close_duration: Duration,

    /// Trip when failures / history_length reaches this, once the window is
    /// full. Must be within [0, 1].
    pub error_rate_threshold: f64,

    /// Sliding window size, in outcomes.
    pub history_length: usize,
}

#[derive(Debug, Clone)]
pub struct BackPressureSettings {
    pub max_buffer_size: usize,

    /// Reject when estimated wait (len / throughput) exceeds this.
    pub threshold_for_expected_wait_time: Duration,

    /// Window for the throughput estimate backing the check above.
    pub max_history_length: Duration,
}

#[derive(Debug, Clone)]
pub struct AutoScalingSettings {
    pub sampler_period: Duration,

    /// Consecutive near-empty samples required before shrinking.
    pub idle_samples_before_shrink: u32,

    /// Consecutive agreeing samples required before any shrink fires.
    pub hysteresis_samples: u32,

    /// Growth is suppressed while the observed error rate exceeds this.
    pub max_error_rate_for_growth: f64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            work_timeout: Duration::from_secs(60),
            work_retry: 0,
            dispatch_history: DispatchHistorySettings::default(),
            worker_pool: WorkerPoolSettings::default(),
            circuit_breaker: None,
            back_pressure: None,
            auto_scaling: None,
        }
    }
}

impl Default for DispatchHistorySettings {
    fn default() -> Self {
        Self {
            max_history_length: Duration::from_secs(10),
        }
    }
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            starting_pool_size: 4,
            min_pool_size: 1,
            max_pool_size: 32,
            max_processing_time: None,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            close_duration: Duration::from_secs(10),
            error_rate_threshold: 0.5,
            history_length: 10,
        }
    }
}

impl Default for BackPressureSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 60_000,
            threshold_for_expected_wait_time: Duration::from_secs(300),
            max_history_length: Duration::from_secs(10),
        }
    }
}

impl Default for AutoScalingSettings {
    fn default() -> Self {
        Self {
            sampler_period: Duration::from_millis(2500),
            idle_samples_before_shrink: 3,
            hysteresis_samples: 2,
            max_error_rate_for_growth: 0.5,
        }
    }
}

impl DispatcherSettings {
    /// Check the record for contradictions. Called by the dispatcher at
    /// construction; a failure here is fatal to creation.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.work_timeout.is_zero() {
            return Err(DispatchError::Config("work_timeout must be non-zero".into()));
        }
        if self.dispatch_history.max_history_length.is_zero() {
            return Err(DispatchError::Config(
                "dispatch_history.max_history_length must be non-zero".into(),
            ));
        }

        let pool = &self.worker_pool;
        if pool.max_pool_size == 0 {
            return Err(DispatchError::Config(
                "worker_pool.max_pool_size must be at least 1".into(),
            ));
        }
        if pool.min_pool_size > pool.max_pool_size {
            return Err(DispatchError::Config(format!(
                "worker_pool.min_pool_size ({}) exceeds max_pool_size ({})",
                pool.min_pool_size, pool.max_pool_size
            )));
        }
        if let Some(cap) = pool.max_processing_time {
            if cap.is_zero() {
                return Err(DispatchError::Config(
                    "worker_pool.max_processing_time must be non-zero when set".into(),
                ));
            }
        }

        if let Some(cb) = &self.circuit_breaker {
            if !(0.0..=1.0).contains(&cb.error_rate_threshold) {
                return Err(DispatchError::Config(format!(
                    "circuit_breaker.error_rate_threshold must be within [0, 1], got {}",
                    cb.error_rate_threshold
                )));
            }
            if cb.history_length == 0 {
                return Err(DispatchError::Config(
                    "circuit_breaker.history_length must be at least 1".into(),
                ));
            }
            if cb.close_duration.is_zero() {
                return Err(DispatchError::Config(
                    "circuit_breaker.close_duration must be non-zero".into(),
                ));
            }
        }

        if let Some(bp) = &self.back_pressure {
            if bp.max_buffer_size == 0 {
                return Err(DispatchError::Config(
                    "back_pressure.max_buffer_size must be at least 1".into(),
                ));
            }
            if bp.max_history_length.is_zero() {
                return Err(DispatchError::Config(
                    "back_pressure.max_history_length must be non-zero".into(),
                ));
            }
        }

        if let Some(scaling) = &self.auto_scaling {
            if scaling.sampler_period.is_zero() {
                return Err(DispatchError::Config(
                    "auto_scaling.sampler_period must be non-zero".into(),
                ));
            }
            if scaling.idle_samples_before_shrink == 0 {
                return Err(DispatchError::Config(
                    "auto_scaling.idle_samples_before_shrink must be at least 1".into(),
                ));
            }
            if !(0.0..=1.0).contains(&scaling.max_error_rate_for_growth) {
                return Err(DispatchError::Config(
                    "auto_scaling.max_error_rate_for_growth must be within [0, 1]".into(),
                ));
            }
        }

        Ok(())
    }

    /// The throughput-estimation window the queue should use. Backpressure
    /// carries its own window when enabled; the dispatch-history block is the
    /// fallback.
    pub fn history_window(&self) -> Duration {
        self.back_pressure
            .as_ref()
            .map(|bp| bp.max_history_length)
            .unwrap_or(self.dispatch_history.max_history_length)
    }
}

/// External config shape. Durations are spelled out in the field names;
/// optional blocks carry an `enabled` flag and are inert without it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub work_timeout_secs: u64,
    pub work_retry: u32,
    pub dispatch_history: RawDispatchHistory,
    pub worker_pool: RawWorkerPool,
    pub circuit_breaker: RawCircuitBreaker,
    pub back_pressure: RawBackPressure,
    pub auto_scaling: RawAutoScaling,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawDispatchHistory {
    pub max_history_length_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawWorkerPool {
    pub starting_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub max_processing_time_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawCircuitBreaker {
    pub enabled: bool,
    pub close_duration_secs: u64,
    pub error_rate_threshold: f64,
    pub history_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawBackPressure {
    pub enabled: bool,
    pub max_buffer_size: usize,
    pub threshold_for_expected_wait_time_secs: u64,
    pub max_history_length_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawAutoScaling {
    pub enabled: bool,
    pub sampler_period_ms: u64,
    pub idle_samples_before_shrink: u32,
    pub hysteresis_samples: u32,
    pub max_error_rate_for_growth: f64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            work_timeout_secs: 60,
            work_retry: 0,
            dispatch_history: RawDispatchHistory::default(),
            worker_pool: RawWorkerPool::default(),
            circuit_breaker: RawCircuitBreaker::default(),
            back_pressure: RawBackPressure::default(),
            auto_scaling: RawAutoScaling::default(),
        }
    }
}

impl Default for RawDispatchHistory {
    fn default() -> Self {
        Self {
            max_history_length_secs: 10,
        }
    }
}

impl Default for RawWorkerPool {
    fn default() -> Self {
        let d = WorkerPoolSettings::default();
        Self {
            starting_pool_size: d.starting_pool_size,
            min_pool_size: d.min_pool_size,
            max_pool_size: d.max_pool_size,
            max_processing_time_secs: None,
        }
    }
}

impl Default for RawCircuitBreaker {
    fn default() -> Self {
        Self {
            enabled: false,
            close_duration_secs: 10,
            error_rate_threshold: 0.5,
            history_length: 10,
        }
    }
}

impl Default for RawBackPressure {
    fn default() -> Self {
        Self {
            enabled: false,
            max_buffer_size: 60_000,
            threshold_for_expected_wait_time_secs: 300,
            max_history_length_secs: 10,
        }
    }
}

impl Default for RawAutoScaling {
    fn default() -> Self {
        Self {
            enabled: false,
            sampler_period_ms: 2500,
            idle_samples_before_shrink: 3,
            hysteresis_samples: 2,
            max_error_rate_for_growth: 0.5,
        }
    }
}

impl RawConfig {
    /// Resolve the external shape into a validated settings record.
    pub fn into_settings(self) -> Result<DispatcherSettings, DispatchError> {
        let settings = DispatcherSettings {
            work_timeout: Duration::from_secs(self.work_timeout_secs),
            work_retry: self.work_retry,
            dispatch_history: DispatchHistorySettings {
                max_history_length: Duration::from_secs(
                    self.dispatch_history.max_history_length_secs,
                ),
            },
            worker_pool: WorkerPoolSettings {
                starting_pool_size: self.worker_pool.starting_pool_size,
                min_pool_size: self.worker_pool.min_pool_size,
                max_pool_size: self.worker_pool.max_pool_size,
                max_processing_time: self
                    .worker_pool
                    .max_processing_time_secs
                    .map(Duration::from_secs),
            },
            circuit_breaker: self.circuit_breaker.enabled.then(|| CircuitBreakerSettings {
                close_duration: Duration::from_secs(self.circuit_breaker.close_duration_secs),
                error_rate_threshold: self.circuit_breaker.error_rate_threshold,
                history_length: self.circuit_breaker.history_length,
            }),
            back_pressure: self.back_pressure.enabled.then(|| BackPressureSettings {
                max_buffer_size: self.back_pressure.max_buffer_size,
                threshold_for_expected_wait_time: Duration::from_secs(
                    self.back_pressure.threshold_for_expected_wait_time_secs,
                ),
                max_history_length: Duration::from_secs(
                    self.back_pressure.max_history_length_secs,
                ),
            }),
            auto_scaling: self.auto_scaling.enabled.then(|| AutoScalingSettings {
                sampler_period: Duration::from_millis(self.auto_scaling.sampler_period_ms),
                idle_samples_before_shrink: self.auto_scaling.idle_samples_before_shrink,
                hysteresis_samples: self.auto_scaling.hysteresis_samples,
                max_error_rate_for_growth: self.auto_scaling.max_error_rate_for_growth,
            }),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DispatcherSettings::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_source_values() {
        let bp = BackPressureSettings::default();
        assert_eq!(bp.max_buffer_size, 60_000);
        assert_eq!(bp.threshold_for_expected_wait_time, Duration::from_secs(300));
        assert_eq!(bp.max_history_length, Duration::from_secs(10));

        let s = DispatcherSettings::default();
        assert_eq!(s.work_timeout, Duration::from_secs(60));
        assert_eq!(s.work_retry, 0);
    }

    #[test]
    fn raw_config_blocks_are_inert_without_enabled() {
        let raw: RawConfig = serde_json::from_value(serde_json::json!({
            "circuit_breaker": { "history_length": 5 },
            "back_pressure": { "max_buffer_size": 2 }
        }))
        .unwrap();
        let settings = raw.into_settings().unwrap();
        assert!(settings.circuit_breaker.is_none());
        assert!(settings.back_pressure.is_none());
        assert!(settings.auto_scaling.is_none());
    }

    #[test]
    fn raw_config_enabled_block_is_resolved() {
        let raw: RawConfig = serde_json::from_value(serde_json::json!({
            "circuit_breaker": {
                "enabled": true,
                "close_duration_secs": 3,
                "error_rate_threshold": 0.6,
                "history_length": 5
            }
        }))
        .unwrap();
        let settings = raw.into_settings().unwrap();
        let cb = settings.circuit_breaker.unwrap();
        assert_eq!(cb.close_duration, Duration::from_secs(3));
        assert_eq!(cb.error_rate_threshold, 0.6);
        assert_eq!(cb.history_length, 5);
    }

    #[test]
    fn out_of_range_threshold_is_fatal() {
        let mut settings = DispatcherSettings::default();
        settings.circuit_breaker = Some(CircuitBreakerSettings {
            error_rate_threshold: 1.5,
            ..CircuitBreakerSettings::default()
        });
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn inverted_pool_bounds_are_fatal() {
        let mut settings = DispatcherSettings::default();
        settings.worker_pool.min_pool_size = 8;
        settings.worker_pool.max_pool_size = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn history_window_prefers_backpressure_block() {
        let mut settings = DispatcherSettings::default();
        assert_eq!(settings.history_window(), Duration::from_secs(10));
        settings.back_pressure = Some(BackPressureSettings {
            max_history_length: Duration::from_secs(4),
            ..BackPressureSettings::default()
        });
        assert_eq!(settings.history_window(), Duration::from_secs(4));
    }
}
