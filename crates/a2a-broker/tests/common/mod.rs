//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use a2a_broker::{BrokerConfig, CircuitBreakerConfig, RetryConfig};
use a2a_common::protocol::{BrokerError, CircuitState, Envelope, EnvelopeId, Payload, Result, WorkerId};
use a2a_common::telemetry::{CallOutcome, Operation, TelemetrySink};
use a2a_common::transport::Transport;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the scripted worker does with one request.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Answer with `{"worker": name, "echo": payload}`
    Echo,
    /// Fail with a retryable transport error
    Fail,
    /// Never answer
    Hang,
    /// Answer after a delay
    Delay(Duration),
}

/// Transport whose replies follow a script, then a default behaviour.
pub struct ScriptedTransport {
    name: String,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Mutex<Behavior>,
    calls: AtomicUsize,
    attempts_seen: Mutex<Vec<u32>>,
}

impl ScriptedTransport {
    pub fn new(name: &str, fallback: Behavior) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
            attempts_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, script: impl IntoIterator<Item = Behavior>) -> Self {
        self.script.lock().unwrap().extend(script);
        self
    }

    pub fn set_fallback(&self, behavior: Behavior) {
        *self.fallback.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, envelope: Envelope) -> Result<Payload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts_seen.lock().unwrap().push(envelope.attempt_count);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());

        match behavior {
            Behavior::Echo => Ok(json!({"worker": self.name, "echo": envelope.payload})),
            Behavior::Fail => Err(BrokerError::Transport(format!("{} connection reset", self.name))),
            Behavior::Hang => std::future::pending().await,
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(json!({"worker": self.name, "late": true}))
            }
        }
    }

    fn endpoint(&self) -> String {
        format!("scripted://{}", self.name)
    }
}

/// Telemetry sink that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingSink {
    pub outcomes: Mutex<Vec<(WorkerId, CallOutcome)>>,
    pub latencies: Mutex<Vec<(WorkerId, Operation)>>,
    pub transitions: Mutex<Vec<(WorkerId, CircuitState, CircuitState)>>,
    pub late: Mutex<Vec<(WorkerId, EnvelopeId, CallOutcome)>>,
}

impl RecordingSink {
    pub fn outcomes_for(&self, worker: &str) -> Vec<CallOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(w, _)| w.as_str() == worker)
            .map(|(_, o)| *o)
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn record_latency(&self, worker: &WorkerId, op: Operation, _duration: Duration) {
        self.latencies.lock().unwrap().push((worker.clone(), op));
    }

    fn record_outcome(&self, worker: &WorkerId, outcome: CallOutcome) {
        self.outcomes.lock().unwrap().push((worker.clone(), outcome));
    }

    fn record_breaker_transition(&self, worker: &WorkerId, from: CircuitState, to: CircuitState) {
        self.transitions.lock().unwrap().push((worker.clone(), from, to));
    }

    fn record_late_response(&self, worker: &WorkerId, envelope_id: EnvelopeId, outcome: CallOutcome) {
        self.late.lock().unwrap().push((worker.clone(), envelope_id, outcome));
    }
}

/// Config with a single attempt and a five-failure breaker.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        retry: RetryConfig {
            max_attempts: 1,
            ..Default::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            cool_down: Duration::from_secs(10),
            half_open_trial_count: 1,
        },
        ..Default::default()
    }
}
