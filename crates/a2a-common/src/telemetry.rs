//! Telemetry sink interface.
//!
//! The broker emits latency, outcome and breaker-transition events through a
//! narrow write-only [`TelemetrySink`]. It never reads anything back, so a
//! no-op sink leaves dispatch behaviour unchanged.
//!
//! # Example
//!
//! ```
//! use a2a_common::telemetry::{CallOutcome, Operation, TelemetrySink};
//! use a2a_common::protocol::{CircuitState, WorkerId};
//! use std::time::Duration;
//!
//! struct LoggingSink;
//!
//! impl TelemetrySink for LoggingSink {
//!     fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
//!         println!("{worker} {op:?} took {duration:?}");
//!     }
//!     fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
//!         println!("{worker} -> {outcome:?}");
//!     }
//!     fn record_breaker_transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState) {
//!         println!("{worker}: {from:?} -> {to:?}");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{CircuitState, EnvelopeId, WorkerId};

/// Operation whose latency is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// One transport attempt of a single call
    Send,
    /// One transport attempt made as a HALF_OPEN probe
    Probe,
    /// Time an envelope spent waiting in the queue
    QueueWait,
    /// Whole fan-out call, from enqueue to aggregate result
    FanOut,
}

/// Terminal (or pending) outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Pending,
    Success,
    Failure,
    Timeout,
    CircuitOpen,
    Expired,
}

impl CallOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallOutcome::Pending)
    }
}

/// Write-only telemetry interface injected by the host process.
pub trait TelemetrySink: Send + Sync {
    fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration);

    fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome);

    fn record_breaker_transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState);

    /// A reply arrived after the dispatcher stopped waiting for it.
    fn record_late_response(&self, _worker: &WorkerId, _envelope_id: EnvelopeId, _outcome: CallOutcome) {}
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_latency(&self, _worker: &WorkerId, _op: Operation, _duration: Duration) {}

    fn record_outcome(&self, _worker: &WorkerId, _outcome: CallOutcome) {}

    fn record_breaker_transition(&self, _worker: &WorkerId, _from: CircuitState, _to: CircuitState) {}
}
