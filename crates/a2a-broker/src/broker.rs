//! The coordinator-facing broker interface and its implementation.

use a2a_common::protocol::{
    next_correlation_id, BrokerError, Envelope, Recipient, Response, Result, WorkerId, WorkerStatus,
};
use a2a_common::telemetry::{NoopTelemetry, Operation, TelemetrySink};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::aggregator::{self, AggregateResult};
use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::queue::{EnvelopeQueue, ExpiredNotice, QueueDepths, Ticket};
use crate::registry::{BreakerTransition, ResolvedWorker, WorkerRegistration, WorkerRegistry, WorkerSnapshot};
use crate::sweeper::Sweeper;
use crate::telemetry::Telemetry;

/// Serializable point-in-time view of a broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerSnapshot {
    pub queue: QueueDepths,
    /// Calls currently held by a transport, across all workers
    pub in_flight: usize,
    pub workers: Vec<WorkerSnapshot>,
}

/// Stable broker interface. Coordinators and workers should depend on this
/// trait rather than on a concrete broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registers a worker. Idempotent; never resets breaker health of a
    /// live registration.
    fn register(&self, registration: WorkerRegistration) -> Result<()>;

    /// Drains a worker and returns its status after the call.
    fn deregister(&self, worker: &WorkerId) -> Result<WorkerStatus>;

    /// Resolves a recipient to its target workers.
    fn resolve(&self, recipient: &Recipient) -> Result<Vec<ResolvedWorker>>;

    /// Admits an envelope and returns a ticket for its eventual result.
    fn enqueue(&self, envelope: Envelope) -> Result<Ticket>;

    /// Sends one envelope and waits for its terminal result.
    async fn dispatch(&self, envelope: Envelope) -> Result<Response>;

    /// Sends a copy of `template` to every recipient concurrently and
    /// aggregates the outcomes. Falls back to the configured default when
    /// `fan_out_deadline` is `None`; with neither, fails with
    /// `InvalidConfig`.
    async fn dispatch_all(
        &self,
        template: Envelope,
        recipients: Vec<WorkerId>,
        fan_out_deadline: Option<Duration>,
    ) -> Result<AggregateResult>;

    /// Stream of envelopes dropped for passing their deadline.
    fn expired_notifications(&self) -> broadcast::Receiver<ExpiredNotice>;

    /// Stream of circuit breaker state changes.
    fn breaker_transitions(&self) -> broadcast::Receiver<BreakerTransition>;

    fn snapshot(&self) -> BrokerSnapshot;
}

/// Queue-driven broker with per-worker circuit breakers.
///
/// Owns a dispatch task and a sweeper task; both stop when the broker is
/// dropped. Must be started inside a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use a2a_broker::{Broker, BrokerConfig, BrokerV1, WorkerRegistration};
/// use a2a_common::protocol::{Capability, Envelope, Recipient};
/// use a2a_common::transport::ChannelTransport;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = BrokerV1::start(BrokerConfig::default())?;
/// let (transport, _task) = ChannelTransport::spawn("coach", 16, |envelope| async move {
///     Ok(envelope.payload)
/// });
/// broker.register(WorkerRegistration::new("coach", [Capability::Coaching], transport))?;
///
/// let envelope = Envelope::new("coordinator", Recipient::Capability(Capability::Coaching), json!("hi"));
/// let response = broker.dispatch(envelope).await?;
/// assert_eq!(response.payload, json!("hi"));
/// # Ok(())
/// # }
/// ```
pub struct BrokerV1 {
    config: BrokerConfig,
    queue: Arc<EnvelopeQueue>,
    registry: Arc<WorkerRegistry>,
    telemetry: Telemetry,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerV1 {
    /// Starts a broker that discards telemetry.
    pub fn start(config: BrokerConfig) -> Result<Self> {
        Self::with_telemetry(config, Arc::new(NoopTelemetry))
    }

    /// Starts a broker reporting to `sink`.
    pub fn with_telemetry(config: BrokerConfig, sink: Arc<dyn TelemetrySink>) -> Result<Self> {
        config.validate()?;
        let telemetry = Telemetry::new(sink);

        let queue = Arc::new(EnvelopeQueue::new(
            config.queue_capacity_per_tier,
            config.notification_capacity,
            telemetry.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            config.circuit_breaker.clone(),
            config.notification_capacity,
            telemetry.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            config.retry.clone(),
            telemetry.clone(),
        ));
        let sweeper = Sweeper::new(registry.clone(), queue.clone(), config.sweep_interval);
        let tasks = vec![dispatcher.spawn(), sweeper.spawn()];

        info!(
            "Broker started: {} slots per tier, {} attempt(s) max, breaker threshold {}",
            config.queue_capacity_per_tier,
            config.retry.max_attempts,
            config.circuit_breaker.failure_threshold
        );

        Ok(Self {
            config,
            queue,
            registry,
            telemetry,
            tasks,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl Drop for BrokerV1 {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Broker for BrokerV1 {
    fn register(&self, registration: WorkerRegistration) -> Result<()> {
        self.registry.register(registration)
    }

    fn deregister(&self, worker: &WorkerId) -> Result<WorkerStatus> {
        self.registry.deregister(worker)
    }

    fn resolve(&self, recipient: &Recipient) -> Result<Vec<ResolvedWorker>> {
        self.registry.resolve(recipient)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<Ticket> {
        if envelope.recipient.is_fan_out() {
            return Err(BrokerError::Validation(
                "multi-worker recipients must be sent with dispatch_all".to_string(),
            ));
        }
        self.queue.enqueue(envelope)
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<Response> {
        if envelope.is_expired() {
            debug!("Envelope {} expired before its first attempt", envelope.id);
            self.queue.notify_expired(&envelope);
            return Err(BrokerError::Expired(envelope.id));
        }
        self.enqueue(envelope)?.wait().await
    }

    async fn dispatch_all(
        &self,
        template: Envelope,
        recipients: Vec<WorkerId>,
        fan_out_deadline: Option<Duration>,
    ) -> Result<AggregateResult> {
        let window = fan_out_deadline
            .or(self.config.default_fan_out_deadline)
            .ok_or_else(|| {
                BrokerError::InvalidConfig("fan-out call needs a deadline".to_string())
            })?;
        if recipients.is_empty() {
            return Err(BrokerError::Validation(
                "fan-out call needs at least one recipient".to_string(),
            ));
        }

        let fan_out_key = Recipient::Workers(recipients.clone()).telemetry_key();
        let started_at = Instant::now();
        let deadline = started_at + window;
        let correlation_id = template.correlation_id.unwrap_or_else(next_correlation_id);

        let mut seen = HashSet::new();
        let children: Vec<_> = recipients
            .into_iter()
            .filter(|worker| seen.insert(worker.clone()))
            .map(|worker| {
                let child = template.child_for(worker.clone(), correlation_id, deadline);
                (worker, self.queue.enqueue(child))
            })
            .collect();

        debug!(
            "Fan-out {} to {} worker(s) with a {:?} deadline",
            correlation_id,
            children.len(),
            window
        );
        let result = aggregator::collect(correlation_id, children, deadline).await;

        self.telemetry
            .latency(&fan_out_key, Operation::FanOut, started_at.elapsed());

        Ok(result)
    }

    fn expired_notifications(&self) -> broadcast::Receiver<ExpiredNotice> {
        self.queue.subscribe_expired()
    }

    fn breaker_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.registry.subscribe_transitions()
    }

    fn snapshot(&self) -> BrokerSnapshot {
        let workers = self.registry.snapshot(Instant::now());
        BrokerSnapshot {
            queue: self.queue.depths(),
            in_flight: workers.iter().map(|w| w.in_flight).sum(),
            workers,
        }
    }
}
