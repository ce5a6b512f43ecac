//! Circuit breaker for one operation type.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: operation assumed broken, calls fail fast
//! - Half-Open: one probe call tests whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: first call after the cooldown elapses (becomes the probe)
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (fresh cooldown)
//! ```
//!
//! # Design Decisions
//! - One breaker per operation type, owned by the governor's state
//! - Not internally synchronized; the governor mutex guards it
//! - Single probe in Half-Open (prevents hammering a recovering dependency)

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn metric_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call was refused by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    /// Remaining cooldown, or `None` while a half-open probe is in flight.
    pub retry_after: Option<Duration>,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub cooldown_secs: u64,
    pub retry_after_secs: Option<u64>,
    pub probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask to run one call. `Ok(true)` means the call is the half-open probe.
    pub fn try_acquire(&mut self, now: Instant) -> Result<bool, CircuitRejection> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(CircuitRejection {
                        retry_after: Some(self.cooldown - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen if self.probe_in_flight => {
                Err(CircuitRejection { retry_after: None })
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    /// Give back a probe slot that never ran (admission failed or the call was cancelled).
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Returns the new state if this success changed it. Only the half-open
    /// probe can close the breaker; a late success from a call admitted
    /// before the trip leaves an open breaker untouched.
    pub fn record_success(&mut self, probe: bool) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen if probe => {
                self.reset();
                Some(CircuitState::Closed)
            }
            _ => None,
        }
    }

    /// Returns the new state if this failure changed it.
    pub fn record_failure(&mut self, now: Instant, probe: bool) -> Option<CircuitState> {
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen if probe => {
                self.trip(now);
                Some(CircuitState::Open)
            }
            CircuitState::Closed if self.failure_count >= self.threshold => {
                self.trip(now);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Closed with no failures recorded: safe to forget.
    pub fn is_pristine(&self) -> bool {
        self.state == CircuitState::Closed && self.failure_count == 0
    }

    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        let retry_after_secs = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.cooldown
                    .saturating_sub(now.duration_since(opened_at))
                    .as_secs(),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            threshold: self.threshold,
            cooldown_secs: self.cooldown.as_secs(),
            retry_after_secs,
            probe_in_flight: self.probe_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn opens_after_consecutive_failures() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(3, COOLDOWN);
        assert_eq!(cb.record_failure(now, false), None);
        assert_eq!(cb.record_failure(now, false), None);
        assert_eq!(cb.record_failure(now, false), Some(CircuitState::Open));
        assert!(cb.try_acquire(now).is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(2, COOLDOWN);
        cb.record_failure(now, false);
        assert_eq!(cb.record_success(false), None);
        assert_eq!(cb.record_failure(now, false), None);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_only_after_cooldown_with_single_probe() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(1, COOLDOWN);
        cb.record_failure(start, false);

        let early = cb.try_acquire(start + Duration::from_secs(59)).unwrap_err();
        assert_eq!(early.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(cb.state(), CircuitState::Open);

        let later = start + COOLDOWN;
        assert_eq!(cb.try_acquire(later), Ok(true));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(
            cb.try_acquire(later),
            Err(CircuitRejection { retry_after: None })
        );

        assert_eq!(cb.record_success(true), Some(CircuitState::Closed));
        assert_eq!(cb.try_acquire(later), Ok(false));
    }

    #[test]
    fn failed_probe_reopens_with_fresh_cooldown() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(1, COOLDOWN);
        cb.record_failure(start, false);

        let probe_at = start + COOLDOWN;
        assert_eq!(cb.try_acquire(probe_at), Ok(true));
        assert_eq!(cb.record_failure(probe_at, true), Some(CircuitState::Open));

        assert!(cb.try_acquire(probe_at + Duration::from_secs(30)).is_err());
        assert_eq!(cb.try_acquire(probe_at + COOLDOWN), Ok(true));
    }

    #[test]
    fn late_outcomes_do_not_skip_the_probe() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(1, COOLDOWN);
        cb.record_failure(start, false);

        assert_eq!(cb.record_success(false), None);
        assert_eq!(cb.state(), CircuitState::Open);
        let early = cb.try_acquire(start + Duration::from_secs(1)).unwrap_err();
        assert_eq!(early.retry_after, Some(Duration::from_secs(59)));

        let later = start + COOLDOWN;
        assert_eq!(cb.try_acquire(later), Ok(true));
        assert_eq!(cb.record_success(false), None);
        assert_eq!(cb.record_failure(later, false), None);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.record_success(true), Some(CircuitState::Closed));
    }

    #[test]
    fn released_probe_can_be_retaken() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(1, COOLDOWN);
        cb.record_failure(start, false);
        let later = start + COOLDOWN;
        assert_eq!(cb.try_acquire(later), Ok(true));
        cb.release_probe();
        assert_eq!(cb.try_acquire(later), Ok(true));
    }

    #[test]
    fn snapshot_reports_remaining_cooldown() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(1, COOLDOWN);
        cb.record_failure(start, false);
        let snap = cb.snapshot(start + Duration::from_secs(20));
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.retry_after_secs, Some(40));
        assert!(!cb.is_pristine());
        cb.reset();
        assert!(cb.is_pristine());
    }
}
