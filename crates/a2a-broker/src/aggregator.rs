//! Collects the child outcomes of a fan-out call into one result.

use a2a_common::protocol::{BrokerError, CorrelationId, Response, Result, WorkerId};
use a2a_common::telemetry::CallOutcome;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::queue::Ticket;

/// A recipient whose call ended in an error other than a timeout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedCall {
    pub worker: WorkerId,
    pub error: String,
}

/// Combined outcome of a fan-out call.
///
/// Every recipient appears in exactly one of the four lists. Non-empty
/// `failed` or `timed_out` is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub correlation_id: CorrelationId,
    pub succeeded: Vec<Response>,
    pub failed: Vec<FailedCall>,
    /// Sent but not answered in time, or timed out/expired on their own
    pub timed_out: Vec<WorkerId>,
    /// Still queued when the fan-out deadline passed
    pub pending: Vec<WorkerId>,
}

impl AggregateResult {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            succeeded: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Whether every recipient succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty() && self.pending.is_empty()
    }

    /// Number of recipients represented.
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.timed_out.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where a recipient ended up, if it took part.
    pub fn outcome_of(&self, worker: &WorkerId) -> Option<CallOutcome> {
        if self.succeeded.iter().any(|r| &r.worker == worker) {
            Some(CallOutcome::Success)
        } else if self.failed.iter().any(|f| &f.worker == worker) {
            Some(CallOutcome::Failure)
        } else if self.timed_out.contains(worker) {
            Some(CallOutcome::Timeout)
        } else if self.pending.contains(worker) {
            Some(CallOutcome::Pending)
        } else {
            None
        }
    }

    pub(crate) fn record(&mut self, worker: WorkerId, result: Result<Response>) {
        match result {
            Ok(response) => self.succeeded.push(response),
            Err(BrokerError::Timeout(_)) | Err(BrokerError::Expired(_)) => self.timed_out.push(worker),
            Err(e) => self.failed.push(FailedCall {
                worker,
                error: e.to_string(),
            }),
        }
    }
}

/// Waits for the children of a fan-out until all are terminal or the
/// deadline passes, whichever comes first.
///
/// Children that failed to enqueue are recorded as failed straight away.
/// Children left over at the deadline are not cancelled; they are reported
/// `timed_out` if already sent and `pending` if still queued.
pub(crate) async fn collect(
    correlation_id: CorrelationId,
    children: Vec<(WorkerId, Result<Ticket>)>,
    deadline: Instant,
) -> AggregateResult {
    let mut result = AggregateResult::new(correlation_id);
    let mut outstanding = BTreeMap::new();
    let mut calls = FuturesUnordered::new();

    for (index, (worker, ticket)) in children.into_iter().enumerate() {
        match ticket {
            Ok(ticket) => {
                outstanding.insert(index, (worker.clone(), ticket.progress()));
                calls.push(async move { (index, worker, ticket.wait().await) });
            }
            Err(e) => result.record(worker, Err(e)),
        }
    }

    while let Ok(Some((index, worker, outcome))) =
        tokio::time::timeout_at(deadline, calls.next()).await
    {
        outstanding.remove(&index);
        result.record(worker, outcome);
    }

    for (worker, started) in outstanding.into_values() {
        if started.load(std::sync::atomic::Ordering::Acquire) {
            result.timed_out.push(worker);
        } else {
            result.pending.push(worker);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnvelopeQueue;
    use crate::telemetry::Telemetry;
    use a2a_common::protocol::{Envelope, Recipient};
    use serde_json::json;
    use std::time::Duration;

    fn envelope(worker: &str) -> Envelope {
        Envelope::new("coordinator", Recipient::Worker(worker.into()), json!({"q": 1}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_classifies_every_child() {
        let queue = EnvelopeQueue::new(8, 8, Telemetry::noop());
        let deadline = Instant::now() + Duration::from_secs(2);

        let ok_ticket = queue.enqueue(envelope("a")).unwrap();
        let err_ticket = queue.enqueue(envelope("b")).unwrap();
        let slow_ticket = queue.enqueue(envelope("c")).unwrap();
        let queued_ticket = queue.enqueue(envelope("d")).unwrap();

        let ok = queue.try_dequeue().unwrap();
        let err = queue.try_dequeue().unwrap();
        let slow = queue.try_dequeue().unwrap();

        let ok_id = ok.envelope.id;
        ok.complete(Ok(Response::new(ok_id, "a".into(), json!("done"))));
        err.complete(Err(BrokerError::WorkerError("bad input".to_string())));
        let (_slow_envelope, slow_completion) = slow.into_parts();
        slow_completion.mark_started();

        let children = vec![
            (WorkerId::from("a"), Ok(ok_ticket)),
            (WorkerId::from("b"), Ok(err_ticket)),
            (WorkerId::from("c"), Ok(slow_ticket)),
            (WorkerId::from("d"), Ok(queued_ticket)),
            (WorkerId::from("e"), Err(BrokerError::QueueFull(a2a_common::protocol::Priority::Normal))),
        ];

        let start = Instant::now();
        let result = collect(7, children, deadline).await;
        assert_eq!(Instant::now() - start, Duration::from_secs(2));

        assert_eq!(result.correlation_id, 7);
        assert_eq!(result.len(), 5);
        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].payload, json!("done"));
        assert_eq!(result.outcome_of(&"b".into()), Some(CallOutcome::Failure));
        assert_eq!(result.outcome_of(&"e".into()), Some(CallOutcome::Failure));
        assert_eq!(result.timed_out, vec![WorkerId::from("c")]);
        assert_eq!(result.pending, vec![WorkerId::from("d")]);
        assert!(!result.is_complete());
        drop(slow_completion);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_returns_early_when_all_done() {
        let queue = EnvelopeQueue::new(8, 8, Telemetry::noop());
        let ticket = queue.enqueue(envelope("a")).unwrap();
        let item = queue.try_dequeue().unwrap();
        let id = item.envelope.id;
        item.complete(Ok(Response::new(id, "a".into(), json!(null))));

        let start = Instant::now();
        let result = collect(1, vec![("a".into(), Ok(ticket))], start + Duration::from_secs(10)).await;
        assert_eq!(Instant::now(), start);
        assert!(result.is_complete());
    }

    #[test]
    fn test_record_treats_expiry_as_timed_out() {
        let mut result = AggregateResult::new(3);
        result.record("a".into(), Err(BrokerError::Expired(9)));
        result.record("b".into(), Err(BrokerError::Timeout(100)));
        result.record("c".into(), Err(BrokerError::CircuitOpen("c".into())));

        assert_eq!(result.timed_out.len(), 2);
        assert_eq!(result.failed[0].worker.as_str(), "c");
        assert!(result.failed[0].error.contains("Circuit open"));
        assert_eq!(result.outcome_of(&"zzz".into()), None);
    }
}
