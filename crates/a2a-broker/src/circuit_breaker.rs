//! Per-worker circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[cool_down elapsed]--> HalfOpen
//! HalfOpen --[half_open_trial_count successful probes]--> Closed
//! HalfOpen --[any probe failure]--> Open (opened_at reset)
//! ```
//!
//! The breaker is plain data; callers pass the current time in and the
//! registry serializes access per worker. Transitions are buffered and
//! drained by the caller so events can be emitted after the lock is
//! released.

use a2a_common::protocol::CircuitState;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, normal traffic
    Normal,
    /// Breaker half-open, this call is the recovery probe
    Probe,
}

/// The breaker refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

/// A state change, buffered until drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    /// Milliseconds since the breaker last opened
    pub opened_ms_ago: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Failures since the current state was entered
    failure_count: u32,
    /// Successes since the current state was entered
    success_count: u32,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Probes run strictly one at a time
    probe_in_flight: bool,
    pending: Vec<Transition>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Swaps in new thresholds. State and counters carry over, so the new
    /// limits apply from the next recorded outcome.
    pub fn set_config(&mut self, config: CircuitBreakerConfig) {
        self.config = config;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Moves an open breaker to half-open once its cool-down has elapsed.
    ///
    /// Returns `true` if the transition happened.
    pub fn poll_cool_down(&mut self, now: Instant) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }

        match self.opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) >= self.config.cool_down => {
                self.transition(CircuitState::HalfOpen, now);
                true
            }
            _ => false,
        }
    }

    /// Decides whether a call may go through.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, Rejected> {
        self.poll_cool_down(now);

        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(Rejected),
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    return Err(Rejected);
                }
                self.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    /// Reports a successful call admitted as `admission`.
    pub fn record_success(&mut self, admission: Admission, now: Instant) {
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.consecutive_failures = 0;
                self.success_count += 1;
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                self.probe_in_flight = false;
                self.consecutive_failures = 0;
                self.success_count += 1;
                if self.success_count >= self.config.half_open_trial_count {
                    self.transition(CircuitState::Closed, now);
                }
            }
            // Calls admitted before the circuit tripped say nothing about recovery
            _ => {}
        }
    }

    /// Reports a failed or timed-out call admitted as `admission`.
    pub fn record_failure(&mut self, admission: Admission, now: Instant) {
        self.consecutive_failures += 1;
        self.failure_count += 1;

        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Admission::Probe) => {
                self.transition(CircuitState::Open, now);
            }
            _ => {}
        }
    }

    /// Reports a reply that arrived after its call was already counted as a
    /// timeout.
    pub fn record_late_success(&mut self) {
        if self.state == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
    }

    /// Takes the transitions recorded since the last drain.
    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.pending)
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            consecutive_failures: self.consecutive_failures,
            probe_in_flight: self.probe_in_flight,
            opened_ms_ago: self
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }

        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.probe_in_flight = false;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {}
        }
        self.pending.push(Transition { from, to });
    }
}
