//! Per-target circuit breakers.
//!
//! One breaker per target, kept in a registry keyed by target name.
//! Each breaker has its own lock so unrelated targets never contend.
//!
//! State machine:
//! - Closed: attempts pass; N consecutive failures open the circuit
//! - Open: attempts fast-fail until the cooldown elapses
//! - HalfOpen: a bounded number of probes; M consecutive successes
//!   close the circuit, any failure reopens it

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
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

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u32,
    /// Time in Open before probes are allowed
    pub cooldown: Duration,
    /// Concurrent probes admitted in HalfOpen
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 2,
        }
    }
}

/// Result of an eligibility check before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed, attempt passes through
    Allowed,
    /// Circuit half-open, attempt counts as a probe
    Probe,
    /// Circuit open, fast-fail without touching the target
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probes_in_flight: u32,
}

pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                opened_at_wall: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Check whether an attempt may proceed. Open circuits whose
    /// cooldown has elapsed transition to HalfOpen here; nothing else
    /// moves a circuit out of Open.
    pub fn try_acquire(&self) -> Permit {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Permit::Allowed,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(target = %self.target, "circuit cooldown elapsed, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probes_in_flight = 1;
                    Permit::Probe
                } else {
                    Permit::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    Permit::Probe
                } else {
                    Permit::Rejected
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(target = %self.target, "circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    inner.opened_at_wall = None;
                    inner.probes_in_flight = 0;
                    metrics::counter!("alertcast_circuit_closed_total", "target" => self.target.clone())
                        .increment(1);
                }
            }
            // Late result from before the circuit opened; ignore
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        target = %self.target,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(target = %self.target, "probe failed, circuit reopened");
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.consecutive_successes = 0;
        inner.probes_in_flight = 0;
        metrics::counter!("alertcast_circuit_opened_total", "target" => self.target.clone())
            .increment(1);
    }

    /// Promote Open to HalfOpen if the cooldown has elapsed, without an
    /// attempt driving the check. Used by the periodic sweep.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if cooled {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.probes_in_flight = 0;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at_wall,
        }
    }
}

/// Snapshot of one breaker for the query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Registry of per-target breakers. Injected into the dispatch path,
/// never a package-level global.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return breaker.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| b.clone())
    }

    pub fn sweep_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().sweep();
        }
    }

    pub fn stats_all(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.iter().map(|e| e.value().stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_millis(50),
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn test_closed_opens_at_threshold() {
        let breaker = CircuitBreaker::new("t", config());
        assert_eq!(breaker.try_acquire(), Permit::Allowed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Permit::Rejected);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("t", config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // Streak restarted, still below threshold
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_cooldown_promotes_to_half_open() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.try_acquire(), Permit::Rejected);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.try_acquire(), Permit::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.try_acquire(), Permit::Probe);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.try_acquire(), Permit::Probe);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Permit::Allowed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.try_acquire(), Permit::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        // Fresh cooldown window
        assert_eq!(breaker.try_acquire(), Permit::Rejected);
    }

    #[test]
    fn test_half_open_probe_limit() {
        let breaker = CircuitBreaker::new("t", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.try_acquire(), Permit::Probe);
        // Only one probe allowed in flight with this config
        assert_eq!(breaker.try_acquire(), Permit::Rejected);
    }

    #[test]
    fn test_sweep_promotes_without_traffic() {
        let registry = CircuitBreakerRegistry::new(config());
        let breaker = registry.get_or_create("t");
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        registry.sweep_all();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_registry_per_target_isolation() {
        let registry = CircuitBreakerRegistry::new(config());
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");

        for _ in 0..3 {
            a.record_failure();
        }
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(registry.len(), 2);
    }
}
