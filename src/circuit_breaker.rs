//! Circuit breaker guarding new-position opens against a burst of venue
//! errors. Reduce-only closes are never blocked by this breaker — a closed
//! breaker only ever gates opening new exposure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    errors: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    error_threshold: u32,
    cooldown: Duration,
    half_open_attempts: u32,
    window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &Config) -> Self {
        Self {
            error_threshold: config.circuit_breaker_error_threshold,
            cooldown: config.circuit_breaker_cooldown,
            half_open_attempts: config.circuit_breaker_half_open_attempts,
            window: Duration::from_secs(3600),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                errors: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Records a venue error and trips the breaker if the rolling-window
    /// count crosses the threshold.
    pub fn record_error(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.errors.push_back(now);
        let window = self.window;
        while inner.errors.front().map(|t| now.duration_since(*t) > window).unwrap_or(false) {
            inner.errors.pop_front();
        }

        match inner.state {
            BreakerState::Closed if inner.errors.len() as u32 >= self.error_threshold => {
                warn!(count = inner.errors.len(), "circuit breaker tripped open");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
            }
            BreakerState::HalfOpen => {
                warn!("probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            _ => {}
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.half_open_attempts {
                info!("circuit breaker closed after successful probes");
                inner.state = BreakerState::Closed;
                inner.errors.clear();
                inner.half_open_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    /// Whether new (non-reduce-only) position opens are currently allowed.
    pub fn allow_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    info!("circuit breaker entering half-open probe state");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
        inner.state != BreakerState::Open
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with(threshold: u32, cooldown: Duration, half_open_attempts: u32) -> CircuitBreaker {
        CircuitBreaker {
            error_threshold: threshold,
            cooldown,
            half_open_attempts,
            window: Duration::from_secs(3600),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                errors: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    #[test]
    fn trips_open_after_threshold_errors() {
        let breaker = breaker_with(3, Duration::from_millis(50), 2);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_error();
        breaker.record_error();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_error();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_open());
    }

    #[test]
    fn half_opens_after_cooldown_then_closes_after_successes() {
        let breaker = breaker_with(1, Duration::from_millis(10), 2);
        breaker.record_error();
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn any_error_while_half_open_reopens() {
        let breaker = breaker_with(1, Duration::from_millis(10), 2);
        breaker.record_error();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_error();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
