//! Per-follower circuit breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,   // Normal operation, calls pass through
    Open,     // Failure threshold reached, calls are refused
    HalfOpen, // Probing whether the follower recovered
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time spent open before probing
    pub reset_timeout: Duration,
    /// Successes in half-open needed to close
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

/// Statistics snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// How long the breaker has been open, if it is
    pub open_for: Option<Duration>,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Failure-tracking state machine gating one follower's submissions.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    /// Whether a call may proceed. Moves open to half-open once the reset
    /// timeout has elapsed.
    pub fn check_at(&self, now: Instant) -> bool {
        let mut s = self.state.lock();

        if s.state == CircuitState::Open {
            let elapsed = s
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if elapsed >= self.config.reset_timeout {
                info!(follower = %self.name, "Circuit breaker open -> half_open");
                s.state = CircuitState::HalfOpen;
                s.half_open_successes = 0;
            } else {
                s.total_rejections += 1;
                return false;
            }
        }

        s.total_calls += 1;
        true
    }

    pub fn record_success(&self) {
        let mut s = self.state.lock();
        s.total_successes += 1;

        match s.state {
            CircuitState::HalfOpen => {
                s.half_open_successes += 1;
                if s.half_open_successes >= self.config.success_threshold {
                    info!(follower = %self.name, "Circuit breaker half_open -> closed");
                    s.state = CircuitState::Closed;
                    s.consecutive_failures = 0;
                    s.half_open_successes = 0;
                    s.opened_at = None;
                }
            }
            CircuitState::Closed => {
                s.consecutive_failures = 0;
            }
            CircuitState::Open => {
                warn!(follower = %self.name, "Success recorded while circuit breaker open");
            }
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut s = self.state.lock();
        s.total_failures += 1;
        s.consecutive_failures += 1;

        match s.state {
            CircuitState::Closed => {
                if s.consecutive_failures >= self.config.failure_threshold {
                    error!(
                        follower = %self.name,
                        failures = s.consecutive_failures,
                        "Circuit breaker closed -> open"
                    );
                    s.state = CircuitState::Open;
                    s.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(follower = %self.name, "Circuit breaker half_open -> open (probe failed)");
                s.state = CircuitState::Open;
                s.opened_at = Some(now);
                s.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        if s.state != CircuitState::Closed {
            info!(follower = %self.name, from = %s.state, "Circuit breaker manually reset");
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.half_open_successes = 0;
        s.opened_at = None;
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.lock();
        BreakerSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            open_for: match s.state {
                CircuitState::Open => s.opened_at.map(|at| at.elapsed()),
                _ => None,
            },
            total_calls: s.total_calls,
            total_successes: s.total_successes,
            total_failures: s.total_failures,
            total_rejections: s.total_rejections,
        }
    }
}
