//! Broker configuration.
//!
//! All knobs are consumed once at construction. [`BrokerConfig::from_env`]
//! overlays environment variables on the defaults; the CLI then overlays its
//! flags on top of that.

use a2a_common::protocol::{BrokerError, Result};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_QUEUE_CAPACITY: &str = "A2A_QUEUE_CAPACITY";
pub const ENV_MAX_ATTEMPTS: &str = "A2A_MAX_ATTEMPTS";
pub const ENV_COOL_DOWN_MS: &str = "A2A_COOL_DOWN_MS";
pub const ENV_FAILURE_THRESHOLD: &str = "A2A_FAILURE_THRESHOLD";
pub const ENV_HALF_OPEN_TRIALS: &str = "A2A_HALF_OPEN_TRIALS";
pub const ENV_FAN_OUT_DEADLINE_MS: &str = "A2A_FAN_OUT_DEADLINE_MS";

/// Configuration for retry logic with exponential backoff.
///
/// Only transport failures are retried, and never past the envelope's
/// deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    ///
    /// Default: 3
    pub max_attempts: u32,
    /// Backoff floor before the first retry becomes eligible
    ///
    /// Default: 50ms
    pub initial_backoff: Duration,
    /// Cap on the backoff floor
    ///
    /// Default: 5s
    pub max_backoff: Duration,
    /// Each retry waits: previous_backoff * multiplier
    ///
    /// Default: 2.0
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff floor applied before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64;
        let backoff_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before tripping the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before letting a probe through
    pub cool_down: Duration,
    /// Successful probes required to close a half-open circuit
    pub half_open_trial_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            half_open_trial_count: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(BrokerError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_trial_count == 0 {
            return Err(BrokerError::InvalidConfig(
                "half_open_trial_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Envelopes each priority tier holds before `enqueue` fails with
    /// `QueueFull`
    pub queue_capacity_per_tier: usize,
    pub retry: RetryConfig,
    /// Breaker settings for workers registered without an override
    pub circuit_breaker: CircuitBreakerConfig,
    /// Fan-out deadline used when a call does not supply one. `None` makes
    /// every fan-out without an explicit deadline an `InvalidConfig` error.
    pub default_fan_out_deadline: Option<Duration>,
    /// How often the sweeper promotes cooled-down breakers and finishes
    /// draining workers
    pub sweep_interval: Duration,
    /// Buffered events per notification stream before slow subscribers lag
    pub notification_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity_per_tier: 1024,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            default_fan_out_deadline: Some(Duration::from_secs(10)),
            sweep_interval: Duration::from_secs(1),
            notification_capacity: 256,
        }
    }
}

impl BrokerConfig {
    /// Defaults overlaid with any `A2A_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from `lookup`, which
    /// keeps tests away from the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_var::<usize, _>(&lookup, ENV_QUEUE_CAPACITY)? {
            config.queue_capacity_per_tier = capacity;
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, ENV_MAX_ATTEMPTS)? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_COOL_DOWN_MS)? {
            config.circuit_breaker.cool_down = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var::<u32, _>(&lookup, ENV_FAILURE_THRESHOLD)? {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(trials) = parse_var::<u32, _>(&lookup, ENV_HALF_OPEN_TRIALS)? {
            config.circuit_breaker.half_open_trial_count = trials;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_FAN_OUT_DEADLINE_MS)? {
            config.default_fan_out_deadline = Some(Duration::from_millis(ms));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity_per_tier == 0 {
            return Err(BrokerError::InvalidConfig(
                "queue_capacity_per_tier must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BrokerError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        if self.default_fan_out_deadline == Some(Duration::ZERO) {
            return Err(BrokerError::InvalidConfig(
                "default fan-out deadline must be non-zero".to_string(),
            ));
        }
        self.circuit_breaker.validate()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            BrokerError::InvalidConfig(format!("{} has invalid value '{}'", key, raw))
        }),
    }
}
