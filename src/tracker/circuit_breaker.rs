//! Circuit breaker guarding calls to the external ad tracker (spec.md §4.6
//! C4). Grounded on `route_quality/mitigation.rs::CircuitBreaker` — same
//! three-state model (Closed/Open/HalfOpen) and cooldown-based recovery,
//! swapped from per-endpoint `HashMap` bookkeeping to a single breaker
//! since C4 talks to exactly one tracker.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            open_duration,
        }
    }

    /// Whether a call may proceed right now. An `Open` breaker past its
    /// cooldown transitions to `HalfOpen` and allows a single probe call.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures += 1;
        if inner.state == CircuitState::HalfOpen || inner.consecutive_failures >= self.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }
}
