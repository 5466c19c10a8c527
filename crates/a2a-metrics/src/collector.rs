// Copyright 2025 A2A Broker Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use a2a_common::protocol::{CircuitState, EnvelopeId, WorkerId};
use a2a_common::telemetry::{CallOutcome, Operation, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;

/// Telemetry sink that aggregates events into a [`MetricsRegistry`].
///
/// # Example
///
/// ```rust
/// use a2a_metrics::MetricsTelemetry;
/// use a2a_common::telemetry::{CallOutcome, TelemetrySink};
/// use a2a_common::protocol::WorkerId;
///
/// let telemetry = MetricsTelemetry::new();
/// telemetry.record_outcome(&WorkerId::from("coach"), CallOutcome::Success);
///
/// let snapshot = telemetry.snapshot();
/// assert_eq!(snapshot.totals.success, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsTelemetry {
    registry: Arc<MetricsRegistry>,
}

impl MetricsTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Snapshot as JSON, for endpoints and CLI output.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl TelemetrySink for MetricsTelemetry {
    fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
        self.registry.record_latency(worker, op, duration);
    }

    fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        self.registry.record_outcome(worker, outcome);
    }

    fn record_breaker_transition(&self, worker: &WorkerId, _from: CircuitState, to: CircuitState) {
        self.registry.record_transition(worker, to);
    }

    fn record_late_response(&self, worker: &WorkerId, _envelope_id: EnvelopeId, _outcome: CallOutcome) {
        self.registry.record_late_response(worker);
    }
}

/// Telemetry sink that writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
        debug!(worker = %worker, op = ?op, latency_us = duration.as_micros() as u64, "latency");
    }

    fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success | CallOutcome::Pending => {
                debug!(worker = %worker, outcome = ?outcome, "call outcome")
            }
            _ => info!(worker = %worker, outcome = ?outcome, "call outcome"),
        }
    }

    fn record_breaker_transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState) {
        info!(worker = %worker, from = ?from, to = ?to, "breaker transition");
    }

    fn record_late_response(&self, worker: &WorkerId, envelope_id: EnvelopeId, outcome: CallOutcome) {
        warn!(worker = %worker, envelope_id, outcome = ?outcome, "late response after timeout");
    }
}

/// Forwards every event to each inner sink in turn.
pub struct FanOutTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanOutTelemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanOutTelemetry {
    fn record_latency(&self, worker: &WorkerId, op: Operation, duration: Duration) {
        for sink in &self.sinks {
            sink.record_latency(worker, op, duration);
        }
    }

    fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        for sink in &self.sinks {
            sink.record_outcome(worker, outcome);
        }
    }

    fn record_breaker_transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState) {
        for sink in &self.sinks {
            sink.record_breaker_transition(worker, from, to);
        }
    }

    fn record_late_response(&self, worker: &WorkerId, envelope_id: EnvelopeId, outcome: CallOutcome) {
        for sink in &self.sinks {
            sink.record_late_response(worker, envelope_id, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_telemetry_records_events() {
        let telemetry = MetricsTelemetry::new();
        let worker = WorkerId::from("nutrition");

        telemetry.record_latency(&worker, Operation::Send, Duration::from_millis(12));
        telemetry.record_outcome(&worker, CallOutcome::Success);
        telemetry.record_outcome(&worker, CallOutcome::Failure);
        telemetry.record_breaker_transition(&worker, CircuitState::Closed, CircuitState::Open);
        telemetry.record_late_response(&worker, 4, CallOutcome::Success);

        let snapshot = telemetry.snapshot();
        let metrics = &snapshot.workers["nutrition"];
        assert_eq!(metrics.outcomes.success, 1);
        assert_eq!(metrics.outcomes.failure, 1);
        assert_eq!(metrics.send_latency.count, 1);
        assert_eq!(metrics.breaker_state, Some(CircuitState::Open));
        assert_eq!(metrics.late_responses, 1);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let telemetry = MetricsTelemetry::new();
        telemetry.record_outcome(&WorkerId::from("a"), CallOutcome::Expired);

        let json = telemetry.snapshot_json();
        assert_eq!(json["totals"]["expired"], 1);
        assert_eq!(json["workers"]["a"]["outcomes"]["expired"], 1);
        assert!(json["uptime_ms"].is_u64());
    }

    #[test]
    fn test_fan_out_telemetry_forwards_to_all() {
        let first = Arc::new(MetricsTelemetry::new());
        let second = Arc::new(MetricsTelemetry::new());
        let sinks: Vec<Arc<dyn TelemetrySink>> = vec![first.clone(), second.clone(), Arc::new(TracingTelemetry)];
        let fan_out = FanOutTelemetry::new(sinks);

        fan_out.record_outcome(&WorkerId::from("w"), CallOutcome::Timeout);

        assert_eq!(first.snapshot().totals.timeout, 1);
        assert_eq!(second.snapshot().totals.timeout, 1);
    }
}
