//! Dispatcher: the pump that drains the queue and runs each call.
//!
//! Every dequeued envelope is handled on its own task, so a slow worker never
//! holds up the pump. One attempt goes through these steps:
//!
//! 1. Drop the envelope as expired if its deadline has passed
//! 2. Resolve the worker and check its registration status
//! 3. Ask the worker's breaker for admission
//! 4. Send through the transport, waiting at most until the deadline
//! 5. Report the outcome to the breaker and telemetry
//! 6. Retry transport failures with backoff, or answer the caller
//!
//! The transport send runs on a task of its own. When the local wait times
//! out that task keeps going, and a reply that turns up later is still fed
//! back to the breaker.

use a2a_common::protocol::{
    BrokerError, Envelope, Payload, Recipient, Response, Result, WorkerStatus,
};
use a2a_common::telemetry::{CallOutcome, Operation};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::circuit_breaker::Admission;
use crate::config::RetryConfig;
use crate::queue::{Completion, EnvelopeQueue, QueuedEnvelope};
use crate::registry::{InFlightGuard, WorkerEntry, WorkerRegistry};
use crate::telemetry::Telemetry;

pub(crate) struct Dispatcher {
    queue: Arc<EnvelopeQueue>,
    registry: Arc<WorkerRegistry>,
    retry: RetryConfig,
    telemetry: Telemetry,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<EnvelopeQueue>,
        registry: Arc<WorkerRegistry>,
        retry: RetryConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            queue,
            registry,
            retry,
            telemetry,
        }
    }

    /// Starts the dispatch loop.
    pub(crate) fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        loop {
            let item = self.queue.dequeue().await;
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.attempt(item).await;
            });
        }
    }

    /// Runs one attempt of one envelope.
    async fn attempt(&self, item: QueuedEnvelope) {
        let enqueued_at = item.enqueued_at;
        let (envelope, completion) = item.into_parts();
        let now = Instant::now();

        if envelope.is_expired_at(now) {
            self.queue.notify_expired(&envelope);
            self.finish(&envelope, completion, Err(BrokerError::Expired(envelope.id)));
            return;
        }

        let (entry, admission) = match self.admit(&envelope, now) {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!("Envelope {} to {} rejected: {}", envelope.id, envelope.recipient, e);
                let outcome = match &e {
                    BrokerError::CircuitOpen(_) => CallOutcome::CircuitOpen,
                    _ => CallOutcome::Failure,
                };
                self.telemetry.outcome(&envelope.recipient.telemetry_key(), outcome);
                self.finish(&envelope, completion, Err(e));
                return;
            }
        };

        let worker = entry.id().clone();
        self.telemetry.latency(
            &worker,
            Operation::QueueWait,
            now.saturating_duration_since(enqueued_at),
        );
        completion.mark_started();
        debug!(
            "Dispatching envelope {} to {} (attempt {}, {:?})",
            envelope.id,
            worker,
            envelope.attempt_count + 1,
            admission
        );

        let started_at = Instant::now();
        let mut rx = self.send(entry.clone(), admission, envelope.clone(), entry.begin_call());

        let result = match tokio::time::timeout_at(envelope.deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Transport(format!(
                "send task for worker {} ended without a result",
                worker
            ))),
            Err(_) => {
                // Hand any reply from now on to the late-response path
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        let waited = Instant::now().saturating_duration_since(started_at);
                        Err(BrokerError::Timeout(waited.as_millis() as u64))
                    }
                }
            }
        };

        let finished_at = Instant::now();
        let op = match admission {
            Admission::Probe => Operation::Probe,
            Admission::Normal => Operation::Send,
        };
        self.telemetry
            .latency(&worker, op, finished_at.saturating_duration_since(started_at));

        match result {
            Ok(payload) => {
                self.registry.record_success(&entry, admission, finished_at);
                self.telemetry.outcome(&worker, CallOutcome::Success);
                let response = Response::new(envelope.id, worker, payload);
                self.finish(&envelope, completion, Ok(response));
            }
            Err(e) => {
                self.registry.record_failure(&entry, admission, finished_at);
                let outcome = match &e {
                    BrokerError::Timeout(_) => CallOutcome::Timeout,
                    _ => CallOutcome::Failure,
                };
                self.telemetry.outcome(&worker, outcome);
                self.retry_or_fail(envelope, completion, e, finished_at);
            }
        }
    }

    /// Resolves the target worker and admits the call through its breaker.
    fn admit(&self, envelope: &Envelope, now: Instant) -> Result<(Arc<WorkerEntry>, Admission)> {
        match &envelope.recipient {
            Recipient::Worker(id) => {
                let entry = self
                    .registry
                    .get(id)
                    .ok_or_else(|| BrokerError::UnknownWorker(id.to_string()))?;
                if entry.status() != WorkerStatus::Active {
                    return Err(BrokerError::WorkerUnavailable(id.clone()));
                }
                let admission = self.registry.acquire(&entry, now)?;
                Ok((entry, admission))
            }
            Recipient::Capability(capability) => self.registry.select(*capability, now),
            Recipient::Workers(_) => Err(BrokerError::Validation(
                "multi-worker recipients must be sent with dispatch_all".to_string(),
            )),
        }
    }

    /// Sends on a detached task. The result comes back on the returned
    /// channel, or goes to the late-response path if nobody is listening.
    fn send(
        &self,
        entry: Arc<WorkerEntry>,
        admission: Admission,
        envelope: Envelope,
        guard: InFlightGuard,
    ) -> oneshot::Receiver<Result<Payload>> {
        let (tx, rx) = oneshot::channel();
        let transport = entry.transport();
        let registry = self.registry.clone();
        let telemetry = self.telemetry.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let envelope_id = envelope.id;
            let result = transport.send(envelope).await;
            if let Err(late) = tx.send(result) {
                let outcome = match late {
                    Ok(_) => {
                        registry.record_late_success(&entry);
                        CallOutcome::Success
                    }
                    Err(_) => CallOutcome::Failure,
                };
                warn!(
                    "Late response after timeout from worker {} for envelope {} ({:?}, {:?})",
                    entry.id(),
                    envelope_id,
                    outcome,
                    admission
                );
                telemetry.late_response(entry.id(), envelope_id, outcome);
            }
        });

        rx
    }

    /// Requeues a failed envelope with a backoff floor when the error,
    /// attempt budget and deadline all allow it. Otherwise answers the
    /// caller with the error.
    fn retry_or_fail(&self, mut envelope: Envelope, completion: Completion, error: BrokerError, now: Instant) {
        let next_attempt = envelope.attempt_count + 1;
        let backoff = self.retry.backoff_for(next_attempt);
        let retry_allowed = error.is_retryable()
            && next_attempt < self.retry.max_attempts
            && now + backoff < envelope.deadline;

        if !retry_allowed {
            warn!(
                "Envelope {} to {} failed after {} attempt(s): {}",
                envelope.id, envelope.recipient, next_attempt, error
            );
            self.finish(&envelope, completion, Err(error));
            return;
        }

        warn!(
            "Envelope {} to {} failed (attempt {}): {}, retrying in {:?}",
            envelope.id, envelope.recipient, next_attempt, error, backoff
        );
        envelope.attempt_count = next_attempt;
        let item = QueuedEnvelope::from_parts(envelope, completion, now, now + backoff);
        if let Err(item) = self.queue.requeue(item) {
            warn!(
                "Tier {} full, giving up on envelope {}",
                item.envelope.priority, item.envelope.id
            );
            let id = item.envelope.id;
            item.complete(Err(error));
            self.queue.release(id);
        }
    }

    /// Delivers a terminal result and frees the envelope id.
    fn finish(&self, envelope: &Envelope, completion: Completion, result: Result<Response>) {
        self.queue.release(envelope.id);
        completion.complete(result);
    }
}
