//! Panic-isolating wrapper around the injected telemetry sink.

use a2a_common::protocol::{CircuitState, EnvelopeId, WorkerId};
use a2a_common::telemetry::{CallOutcome, NoopTelemetry, Operation, TelemetrySink};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Forwards events to a [`TelemetrySink`], swallowing any panic it raises.
///
/// Dispatch never observes telemetry: a sink that panics loses the event
/// and nothing else.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopTelemetry))
    }

    pub fn latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
        self.guard("latency", |sink| sink.record_latency(worker, op, duration));
    }

    pub fn outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        self.guard("outcome", |sink| sink.record_outcome(worker, outcome));
    }

    pub fn transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState) {
        self.guard("breaker transition", |sink| {
            sink.record_breaker_transition(worker, from, to)
        });
    }

    pub fn late_response(&self, worker: &WorkerId, envelope_id: EnvelopeId, outcome: CallOutcome) {
        self.guard("late response", |sink| {
            sink.record_late_response(worker, envelope_id, outcome)
        });
    }

    fn guard<F>(&self, event: &str, f: F)
    where
        F: FnOnce(&dyn TelemetrySink),
    {
        let sink = self.sink.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(sink))).is_err() {
            warn!("Telemetry sink panicked while recording {} event", event);
        }
    }
}
