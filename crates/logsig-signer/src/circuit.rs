//! Per-endpoint circuit breaker for high-availability signing.
//!
//! An endpoint that keeps failing is skipped for a while instead of
//! receiving every request and answering each one with an error. After the
//! open timeout a few trial requests decide whether it is back.
//!
//! ```text
//!   CLOSED ──(N failures or failure rate)──▶ OPEN
//!     ▲                                       │
//!     │ M successes                           │ open timeout
//!     │                                       ▼
//!     └──────────────────────────────── HALF-OPEN ──(any failure)──▶ OPEN
//! ```
//!
//! The breaker is owned by the signing worker and takes the current instant
//! as an argument, so it needs no locking and no wall clock of its own.

use std::{
    fmt,
    time::{Duration, Instant},
};

use tracing::{info, warn};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Minimum requests before the failure rate is considered.
    pub min_requests_for_rate: u32,
    /// Failure rate (0.0 to 1.0) that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Time spent open before trial requests are allowed.
    pub open_timeout: Duration,
    /// Consecutive successes that close a half-open circuit.
    pub success_threshold: u32,
    /// Trial requests allowed while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_requests: 3,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all requests allowed.
    Closed,
    /// Endpoint unhealthy - requests skipped.
    Open,
    /// Testing recovery - limited requests allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters of one circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitStats {
    /// Consecutive failures in the current state.
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open.
    pub consecutive_successes: u32,
    /// Requests in the current window.
    pub total_requests: u32,
    /// Failed requests in the current window.
    pub failed_requests: u32,
    /// Trial requests made while half-open.
    pub half_open_requests: u32,
}

impl CircuitStats {
    /// Failure rate of the current window (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Circuit breaker of a single endpoint.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitConfig,
    state: CircuitState,
    stats: CircuitStats,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `endpoint`.
    pub fn new(endpoint: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: CircuitState::Closed,
            stats: CircuitStats::default(),
            opened_at: None,
        }
    }

    /// Current state, without applying the open timeout.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Current counters.
    pub fn stats(&self) -> &CircuitStats {
        &self.stats
    }

    /// Whether a request may be sent at `now`.
    ///
    /// An open circuit whose timeout elapsed moves to half-open here.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|opened| now.saturating_duration_since(opened));
            if elapsed.is_some_and(|elapsed| elapsed >= self.config.open_timeout) {
                self.transition_to_half_open();
            }
        }

        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.stats.half_open_requests < self.config.half_open_max_requests,
        }
    }

    /// Records a successful request.
    pub fn record_success(&mut self) {
        self.stats.total_requests += 1;
        self.stats.consecutive_failures = 0;

        match self.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                warn!(endpoint = %self.endpoint, "recorded success for open circuit");
            },
            CircuitState::HalfOpen => {
                self.stats.consecutive_successes += 1;
                self.stats.half_open_requests += 1;

                if self.stats.consecutive_successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            },
        }
    }

    /// Records a failed request observed at `now`.
    pub fn record_failure(&mut self, now: Instant) {
        self.stats.total_requests += 1;
        self.stats.failed_requests += 1;
        self.stats.consecutive_failures += 1;
        self.stats.consecutive_successes = 0;

        match self.state {
            CircuitState::Closed => {
                if self.should_open() {
                    self.transition_to_open(now);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                self.stats.half_open_requests += 1;
                self.transition_to_open(now);
            },
        }
    }

    fn should_open(&self) -> bool {
        if self.stats.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        self.stats.total_requests >= self.config.min_requests_for_rate
            && self.stats.failure_rate() >= self.config.failure_rate_threshold
    }

    fn transition_to_open(&mut self, now: Instant) {
        warn!(
            endpoint = %self.endpoint,
            failures = self.stats.consecutive_failures,
            failure_rate = self.stats.failure_rate(),
            "circuit breaker opening"
        );

        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }

    fn transition_to_half_open(&mut self) {
        info!(endpoint = %self.endpoint, "circuit breaker transitioning to half-open");

        self.state = CircuitState::HalfOpen;
        self.stats.half_open_requests = 0;
        self.stats.consecutive_successes = 0;
    }

    fn transition_to_closed(&mut self) {
        info!(endpoint = %self.endpoint, "circuit breaker closing, endpoint recovered");

        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            min_requests_for_rate: 5,
            failure_rate_threshold: 0.6,
            open_timeout: Duration::from_secs(10),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }

    #[test]
    fn circuit_starts_closed() {
        let mut breaker = CircuitBreaker::new("ksi+tcp://a", test_config());
        assert!(breaker.allow_request(Instant::now()));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn consecutive_failures_open_circuit() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new("ksi+tcp://a", test_config());

        for _ in 0..2 {
            breaker.record_failure(now);
            assert!(breaker.allow_request(now));
        }

        breaker.record_failure(now);
        assert!(!breaker.allow_request(now));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn failure_rate_opens_circuit() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new("ksi+tcp://a", test_config());

        // F S F S F: never three in a row, but 60% after five requests
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(now);

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_circuit_recovers_through_half_open() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new("ksi+tcp://a", test_config());
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        assert!(!breaker.allow_request(start + Duration::from_secs(9)));

        let later = start + Duration::from_secs(10);
        assert!(breaker.allow_request(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats(), &CircuitStats::default());
    }

    #[test]
    fn half_open_failure_reopens_and_limits_trials() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new("ksi+tcp://a", test_config());
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        let later = start + Duration::from_secs(11);
        assert!(breaker.allow_request(later));
        breaker.record_failure(later);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request(later + Duration::from_secs(1)));
    }
}
