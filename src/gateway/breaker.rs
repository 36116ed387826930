// Circuit breaker per upstream worker address.
//
// Closed -> Open on consecutive failures or a bad error rate inside the
// rolling window; Open -> HalfOpen after the reset timeout; HalfOpen admits
// a bounded number of probes whose outcomes re-close or re-open the
// breaker. One mutex per breaker, registry under a reader/writer lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub max_failures: u32,
    /// Time in Open before probing.
    pub reset_timeout: Duration,
    /// Probe budget while half-open.
    pub half_open_max_reqs: u32,
    /// Successful probes needed to close again.
    pub success_threshold: u32,
    /// Error-rate trip: failures/requests over the rolling window.
    pub error_rate_threshold: f64,
    /// Minimum requests in the window before the rate applies.
    pub window_min_requests: u32,
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_reqs: 3,
            success_threshold: 1,
            error_rate_threshold: 0.5,
            window_min_requests: 20,
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    window_start: Instant,
    window_requests: u32,
    window_failures: u32,
}

pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                window_start: Instant::now(),
                window_requests: 0,
                window_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn roll_window(&self, inner: &mut BreakerInner) {
        if inner.window_start.elapsed() > self.config.window {
            inner.window_start = Instant::now();
            inner.window_requests = 0;
            inner.window_failures = 0;
        }
    }

    /// Gate one request. Fast-fails with CircuitOpen while the breaker is
    /// open or the half-open probe budget is spent.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    debug!(target = %self.target, "breaker half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(PlatformError::CircuitOpen(self.target.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_reqs {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(PlatformError::CircuitOpen(self.target.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.roll_window(&mut inner);
        inner.window_requests += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(target = %self.target, "breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.roll_window(&mut inner);
        inner.window_requests += 1;
        inner.window_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                let rate_tripped = inner.window_requests >= self.config.window_min_requests
                    && inner.window_failures as f64 / inner.window_requests as f64
                        >= self.config.error_rate_threshold;
                if inner.consecutive_failures >= self.config.max_failures || rate_tripped {
                    warn!(target = %self.target, failures = inner.consecutive_failures, "breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(target = %self.target, "probe failed, breaker re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Address -> breaker map with double-checked creation.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(target) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "http://10.0.0.6:8091",
            BreakerConfig {
                max_failures,
                reset_timeout: reset,
                ..BreakerConfig::default()
            },
        )
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let b = breaker(3, Duration::from_millis(100));
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(
            b.try_acquire().unwrap_err(),
            PlatformError::CircuitOpen(_)
        ));
    }

    #[test]
    fn test_probe_success_closes() {
        let b = breaker(3, Duration::from_millis(50));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(60));
        b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let b = breaker(3, Duration::from_millis(50));
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_probe_budget() {
        let b = CircuitBreaker::new(
            "target",
            BreakerConfig {
                max_failures: 1,
                reset_timeout: Duration::from_millis(10),
                half_open_max_reqs: 2,
                success_threshold: 3,
                ..BreakerConfig::default()
            },
        );
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        b.try_acquire().unwrap(); // probe 1
        b.try_acquire().unwrap(); // probe 2
        assert!(b.try_acquire().is_err()); // budget spent
    }

    #[test]
    fn test_error_rate_trip() {
        let b = CircuitBreaker::new(
            "target",
            BreakerConfig {
                max_failures: 1_000, // rate path only
                window_min_requests: 10,
                error_rate_threshold: 0.5,
                ..BreakerConfig::default()
            },
        );
        for _ in 0..5 {
            b.record_success();
        }
        for _ in 0..6 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_shares_instances() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("http://10.0.0.6:8091");
        let b = registry.get("http://10.0.0.6:8091");
        a.record_failure();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
