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

use a2a_common::protocol::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub circuit_open: u64,
    pub expired: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.success + self.failure + self.timeout + self.circuit_open + self.expired
    }
}

/// Latency summary for one operation, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub count: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Metrics for a specific worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub outcomes: OutcomeCounts,
    pub send_latency: LatencyMetrics,
    pub probe_latency: LatencyMetrics,
    pub queue_wait: LatencyMetrics,
    pub fan_out_latency: LatencyMetrics,
    /// Last breaker state reported, if any transition was seen
    pub breaker_state: Option<CircuitState>,
    pub breaker_transitions: u64,
    pub times_opened: u64,
    pub late_responses: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub totals: OutcomeCounts,
    pub workers: BTreeMap<String, WorkerMetrics>,
}
