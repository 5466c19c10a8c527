//! In-process load simulation.
//!
//! Starts a broker with simulated channel workers, some of which always
//! fail, and pushes a burst of capability-routed envelopes through it.
//! The report shows how retries and breakers spread the load.

use a2a_broker::{Broker, BrokerConfig, BrokerSnapshot, BrokerV1, WorkerRegistration};
use a2a_common::protocol::{BrokerError, Capability, Envelope, Priority, Recipient};
use a2a_common::telemetry::TelemetrySink;
use a2a_common::transport::ChannelTransport;
use a2a_metrics::{FanOutTelemetry, MetricsSnapshot, MetricsTelemetry, TracingTelemetry};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    /// Number of simulated workers, all serving the same capability
    pub workers: usize,
    /// How many of those workers fail every call with a transport error
    pub flaky: usize,
    pub requests: usize,
    /// Per-call latency of healthy workers
    pub latency: Duration,
    pub ttl: Duration,
    pub capability: Capability,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            flaky: 1,
            requests: 50,
            latency: Duration::from_millis(5),
            ttl: Duration::from_secs(5),
            capability: Capability::Coaching,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub dispatched: usize,
    pub succeeded: usize,
    /// Failed calls keyed by error kind
    pub failed: BTreeMap<&'static str, usize>,
    /// Successful calls keyed by the worker that answered
    pub answered_by: BTreeMap<String, usize>,
    pub broker: BrokerSnapshot,
    pub metrics: MetricsSnapshot,
}

fn error_kind(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::Validation(_) => "validation",
        BrokerError::DuplicateId(_) => "duplicate_id",
        BrokerError::QueueFull(_) => "queue_full",
        BrokerError::UnknownWorker(_) => "unknown_worker",
        BrokerError::WorkerUnavailable(_) => "worker_unavailable",
        BrokerError::CircuitOpen(_) => "circuit_open",
        BrokerError::Transport(_) => "transport",
        BrokerError::WorkerError(_) => "worker_error",
        BrokerError::Timeout(_) => "timeout",
        BrokerError::Expired(_) => "expired",
        BrokerError::InvalidConfig(_) => "invalid_config",
        BrokerError::JsonSerialization(_) => "json",
        BrokerError::Io(_) => "io",
    }
}

/// Runs one simulation to completion.
pub async fn run(config: BrokerConfig, options: SimulationOptions) -> anyhow::Result<SimulationReport> {
    if options.workers == 0 {
        anyhow::bail!("simulation needs at least one worker");
    }

    let metrics = MetricsTelemetry::new();
    let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(metrics.clone()), Arc::new(TracingTelemetry)];
    let broker = Arc::new(BrokerV1::with_telemetry(config, Arc::new(FanOutTelemetry::new(sinks)))?);

    let mut worker_tasks = Vec::with_capacity(options.workers);
    for i in 0..options.workers {
        let name = format!("sim-{}", i);
        let flaky = i < options.flaky;
        let latency = options.latency;
        let worker_name = name.clone();
        let (transport, task) = ChannelTransport::spawn(name.clone(), 64, move |envelope: Envelope| {
            let worker_name = worker_name.clone();
            async move {
                tokio::time::sleep(latency).await;
                if flaky {
                    Err(BrokerError::Transport(format!("{} is misbehaving", worker_name)))
                } else {
                    Ok(json!({ "worker": worker_name, "echo": envelope.payload }))
                }
            }
        });
        broker.register(WorkerRegistration::new(name, [options.capability], transport))?;
        worker_tasks.push(task);
    }
    tracing::info!(
        "Simulating {} requests across {} workers ({} flaky)",
        options.requests,
        options.workers,
        options.flaky.min(options.workers)
    );

    let mut calls = JoinSet::new();
    for n in 0..options.requests {
        let broker = broker.clone();
        let priority = Priority::DESCENDING[n % Priority::COUNT];
        let envelope = Envelope::new("simulator", Recipient::Capability(options.capability), json!({ "request": n }))
            .with_priority(priority)
            .with_ttl(options.ttl);
        calls.spawn(async move { broker.dispatch(envelope).await });
    }

    let mut succeeded = 0;
    let mut failed = BTreeMap::new();
    let mut answered_by = BTreeMap::new();
    while let Some(joined) = calls.join_next().await {
        match joined? {
            Ok(response) => {
                succeeded += 1;
                *answered_by.entry(response.worker.to_string()).or_insert(0) += 1;
            }
            Err(e) => *failed.entry(error_kind(&e)).or_insert(0) += 1,
        }
    }

    let report = SimulationReport {
        dispatched: options.requests,
        succeeded,
        failed,
        answered_by,
        broker: broker.snapshot(),
        metrics: metrics.snapshot(),
    };

    for task in worker_tasks {
        task.abort();
    }
    Ok(report)
}
