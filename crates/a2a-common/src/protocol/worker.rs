//! Worker identity, capability tags and status types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::BrokerError;

/// Identity of a worker registered with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Task types a worker can accept.
///
/// Capabilities are declared once at registration and never inferred from
/// the payload of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Coaching,
    Biometrics,
    Nutrition,
    Training,
    Recovery,
    Scheduling,
    Summarization,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Coaching,
        Capability::Biometrics,
        Capability::Nutrition,
        Capability::Training,
        Capability::Recovery,
        Capability::Scheduling,
        Capability::Summarization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Coaching => "coaching",
            Capability::Biometrics => "biometrics",
            Capability::Nutrition => "nutrition",
            Capability::Training => "training",
            Capability::Recovery => "recovery",
            Capability::Scheduling => "scheduling",
            Capability::Summarization => "summarization",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BrokerError::Validation(format!("unknown capability '{}'", s)))
    }
}

/// Registration status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Accepting calls
    Active,
    /// Deregistration requested, in-flight calls are completing
    Draining,
    /// No longer accepting calls
    Removed,
}

/// Circuit breaker state for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through
    Closed,
    /// Tripped, calls fail fast without reaching the worker
    Open,
    /// Cool-down elapsed, probing whether the worker recovered
    HalfOpen,
}
