//! Circuit breaker state machine.
//!
//! Owned by the processor and driven entirely by messages it already
//! receives, so the whole thing stays a plain struct: admit on permit
//! requests, record on attempt outcomes. Open -> HalfOpen happens lazily on
//! the first admit at or past `until`; no timer task exists.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerSettings;

/// How long a worker is told to back off while another worker's probe is
/// still out.
const PROBE_RECHECK: Duration = Duration::from_millis(25);

/// Gate decision for one permit request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Gate {
    Pass,
    /// Dispatch allowed, and this dispatch is the half-open probe.
    Probe,
    Hold { retry_after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BreakerEvent {
    Opened,
    Closed,
}

/// Externally visible breaker state, for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerView {
    Disabled,
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    state: State,

    /// Sliding window of attempt outcomes (`true` = success), only fed while
    /// closed. The trip rate is failures over *capacity*, so it is only
    /// meaningful once the window is full.
    window: VecDeque<bool>,

    probe_outstanding: bool,
}

impl CircuitBreaker {
    pub(crate) fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            state: State::Closed,
            window: VecDeque::new(),
            probe_outstanding: false,
        }
    }

    pub(crate) fn admit(&mut self, now: Instant) -> Gate {
        match self.state {
            State::Closed => Gate::Pass,
            State::Open { until } => {
                if now >= until {
                    self.state = State::HalfOpen;
                    self.probe_outstanding = true;
                    Gate::Probe
                } else {
                    Gate::Hold {
                        retry_after: until.duration_since(now),
                    }
                }
            }
            State::HalfOpen => {
                if self.probe_outstanding {
                    Gate::Hold {
                        retry_after: PROBE_RECHECK,
                    }
                } else {
                    self.probe_outstanding = true;
                    Gate::Probe
                }
            }
        }
    }

    /// The probe grant went unused; allow another probe.
    pub(crate) fn release_probe(&mut self) {
        self.probe_outstanding = false;
    }

    pub(crate) fn on_outcome(
        &mut self,
        success: bool,
        probe: bool,
        now: Instant,
    ) -> Option<BreakerEvent> {
        if probe {
            if matches!(self.state, State::HalfOpen) {
                self.probe_outstanding = false;
                if success {
                    self.state = State::Closed;
                    self.window.clear();
                    return Some(BreakerEvent::Closed);
                }
                self.state = State::Open {
                    until: now + self.settings.close_duration,
                };
                return Some(BreakerEvent::Opened);
            }
            return None;
        }

        match self.state {
            State::Closed => {
                self.window.push_back(success);
                if self.window.len() > self.settings.history_length {
                    self.window.pop_front();
                }
                if self.window.len() == self.settings.history_length {
                    let failures = self.window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / self.settings.history_length as f64;
                    if failures > 0 && rate >= self.settings.error_rate_threshold {
                        self.state = State::Open {
                            until: now + self.settings.close_duration,
                        };
                        return Some(BreakerEvent::Opened);
                    }
                }
                None
            }
            // Stragglers from attempts started before the trip.
            State::Open { .. } | State::HalfOpen => None,
        }
    }

    pub(crate) fn view(&self) -> BreakerView {
        match self.state {
            State::Closed => BreakerView::Closed,
            State::Open { .. } => BreakerView::Open,
            State::HalfOpen => BreakerView::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(history: usize, threshold: f64, close: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerSettings {
            close_duration: close,
            error_rate_threshold: threshold,
            history_length: history,
        })
    }

    #[tokio::test]
    async fn trips_only_once_the_window_is_full() {
        let mut b = breaker(5, 0.6, Duration::from_secs(1));
        let now = Instant::now();

        // Four failures: 4/5 would already exceed 0.6, but the window is not
        // full yet.
        for _ in 0..4 {
            assert_eq!(b.on_outcome(false, false, now), None);
            assert_eq!(b.admit(now), Gate::Pass);
        }
        assert_eq!(b.on_outcome(false, false, now), Some(BreakerEvent::Opened));
        assert!(matches!(b.admit(now), Gate::Hold { .. }));
        assert_eq!(b.view(), BreakerView::Open);
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let mut b = breaker(4, 0.75, Duration::from_secs(1));
        let now = Instant::now();
        for ok in [false, true, false, true, false, true] {
            assert_eq!(b.on_outcome(ok, false, now), None);
        }
        assert_eq!(b.view(), BreakerView::Closed);
    }

    #[tokio::test]
    async fn half_open_permits_exactly_one_probe() {
        let mut b = breaker(2, 0.5, Duration::from_millis(100));
        let now = Instant::now();
        b.on_outcome(false, false, now);
        assert_eq!(b.on_outcome(false, false, now), Some(BreakerEvent::Opened));

        let later = now + Duration::from_millis(150);
        assert_eq!(b.admit(later), Gate::Probe);
        assert_eq!(b.view(), BreakerView::HalfOpen);
        assert!(matches!(b.admit(later), Gate::Hold { .. }));

        // Unused probe grant frees the slot for the next asker.
        b.release_probe();
        assert_eq!(b.admit(later), Gate::Probe);
    }

    #[tokio::test]
    async fn probe_success_closes_and_resets_the_window() {
        let mut b = breaker(2, 0.5, Duration::from_millis(50));
        let now = Instant::now();
        b.on_outcome(false, false, now);
        b.on_outcome(false, false, now);

        let later = now + Duration::from_millis(60);
        assert_eq!(b.admit(later), Gate::Probe);
        assert_eq!(b.on_outcome(true, true, later), Some(BreakerEvent::Closed));
        assert_eq!(b.view(), BreakerView::Closed);

        // Window was reset: one more failure must not trip on stale history.
        assert_eq!(b.on_outcome(false, false, later), None);
    }

    #[tokio::test]
    async fn probe_failure_reopens_for_a_fresh_close_duration() {
        let mut b = breaker(2, 0.5, Duration::from_millis(50));
        let now = Instant::now();
        b.on_outcome(false, false, now);
        b.on_outcome(false, false, now);

        let later = now + Duration::from_millis(60);
        assert_eq!(b.admit(later), Gate::Probe);
        assert_eq!(b.on_outcome(false, true, later), Some(BreakerEvent::Opened));
        match b.admit(later) {
            Gate::Hold { retry_after } => assert!(retry_after <= Duration::from_millis(50)),
            other => panic!("expected hold, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn straggler_outcomes_while_open_are_ignored() {
        let mut b = breaker(2, 0.5, Duration::from_secs(10));
        let now = Instant::now();
        b.on_outcome(false, false, now);
        b.on_outcome(false, false, now);
        assert_eq!(b.view(), BreakerView::Open);
        assert_eq!(b.on_outcome(true, false, now), None);
        assert_eq!(b.view(), BreakerView::Open);
    }
}
