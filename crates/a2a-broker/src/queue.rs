//! Priority queue of envelopes.
//!
//! The queue is one bounded FIFO lane per priority tier. `dequeue` scans the
//! lanes from `Critical` down to `Low` and returns the first eligible
//! envelope, so a lower tier is never served while a higher tier has work.
//! Lanes stay ordered by `created_at`, which keeps pop order FIFO inside a
//! tier even when a retry is put back.
//!
//! Envelopes whose deadline passes while queued are removed, their caller is
//! answered with `Expired`, and an [`ExpiredNotice`] is broadcast.

use a2a_common::protocol::{
    BrokerError, CorrelationId, Envelope, EnvelopeId, Priority, Recipient, Response, Result,
};
use a2a_common::telemetry::CallOutcome;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::telemetry::Telemetry;

/// Notice broadcast when an envelope is dropped for passing its deadline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiredNotice {
    pub envelope_id: EnvelopeId,
    pub recipient: Recipient,
    pub priority: Priority,
    pub correlation_id: Option<CorrelationId>,
    pub attempt_count: u32,
    /// Time the envelope lived before it was dropped
    pub age: Duration,
}

impl ExpiredNotice {
    fn for_envelope(envelope: &Envelope, now: Instant) -> Self {
        Self {
            envelope_id: envelope.id,
            recipient: envelope.recipient.clone(),
            priority: envelope.priority,
            correlation_id: envelope.correlation_id,
            attempt_count: envelope.attempt_count,
            age: now.saturating_duration_since(envelope.created_at),
        }
    }
}

/// Where the final result of an enqueued envelope is delivered.
pub(crate) struct Completion {
    reply: oneshot::Sender<Result<Response>>,
    started: Arc<AtomicBool>,
}

impl Completion {
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn complete(self, result: Result<Response>) {
        // The caller may have stopped waiting, e.g. a fan-out past its deadline
        let _ = self.reply.send(result);
    }
}

/// Handle to the eventual result of an enqueued envelope.
pub struct Ticket {
    envelope_id: EnvelopeId,
    started: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<Response>>,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("envelope_id", &self.envelope_id)
            .field("started", &self.has_started())
            .finish()
    }
}

impl Ticket {
    pub fn envelope_id(&self) -> EnvelopeId {
        self.envelope_id
    }

    /// Whether the dispatcher has handed the envelope to a transport.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn progress(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> Result<Response> {
        self.rx.await.unwrap_or_else(|_| {
            Err(BrokerError::Transport(
                "broker shut down before the call completed".to_string(),
            ))
        })
    }
}

/// An envelope sitting in the queue.
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
    /// Earliest time the envelope may be dequeued (backoff floor for retries)
    pub eligible_at: Instant,
    completion: Completion,
}

impl QueuedEnvelope {
    fn new(envelope: Envelope, now: Instant) -> (Self, Ticket) {
        let (tx, rx) = oneshot::channel();
        let started = Arc::new(AtomicBool::new(false));
        let ticket = Ticket {
            envelope_id: envelope.id,
            started: started.clone(),
            rx,
        };
        let queued = Self {
            envelope,
            enqueued_at: now,
            eligible_at: now,
            completion: Completion { reply: tx, started },
        };
        (queued, ticket)
    }

    pub(crate) fn into_parts(self) -> (Envelope, Completion) {
        (self.envelope, self.completion)
    }

    pub(crate) fn from_parts(
        envelope: Envelope,
        completion: Completion,
        enqueued_at: Instant,
        eligible_at: Instant,
    ) -> Self {
        Self {
            envelope,
            enqueued_at,
            eligible_at,
            completion,
        }
    }

    /// Answers the caller directly, bypassing dispatch.
    pub(crate) fn complete(self, result: Result<Response>) {
        self.completion.complete(result);
    }
}

/// Per-tier depth, as reported in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    /// Envelopes enqueued and not yet terminal (queued or in flight)
    pub pending: usize,
}

struct QueueState {
    lanes: [VecDeque<QueuedEnvelope>; Priority::COUNT],
    pending_ids: HashSet<EnvelopeId>,
}

/// Result of one pass over the lanes.
struct Scan {
    found: Option<QueuedEnvelope>,
    expired: Vec<QueuedEnvelope>,
    wake_at: Option<Instant>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            lanes: Default::default(),
            pending_ids: HashSet::new(),
        }
    }

    fn insert_ordered(&mut self, item: QueuedEnvelope) {
        let lane = &mut self.lanes[item.envelope.priority.lane()];
        let created_at = item.envelope.created_at;
        let idx = lane.partition_point(|q| q.envelope.created_at <= created_at);
        lane.insert(idx, item);
    }

    fn take_expired(lane: &mut VecDeque<QueuedEnvelope>, now: Instant, out: &mut Vec<QueuedEnvelope>) {
        let mut i = 0;
        while i < lane.len() {
            if lane[i].envelope.is_expired_at(now) {
                if let Some(item) = lane.remove(i) {
                    out.push(item);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Finds the highest-priority, oldest eligible envelope, removing any
    /// expired envelopes it walks past.
    fn scan(&mut self, now: Instant) -> Scan {
        let mut expired = Vec::new();
        let mut wake_at: Option<Instant> = None;

        for priority in Priority::DESCENDING {
            let lane = &mut self.lanes[priority.lane()];
            let mut i = 0;
            while i < lane.len() {
                let item = &lane[i];
                if item.envelope.is_expired_at(now) {
                    if let Some(item) = lane.remove(i) {
                        expired.push(item);
                    }
                    continue;
                }
                if item.eligible_at <= now {
                    let found = lane.remove(i);
                    for item in &expired {
                        self.pending_ids.remove(&item.envelope.id);
                    }
                    return Scan {
                        found,
                        expired,
                        wake_at: None,
                    };
                }
                let wake = item.eligible_at.min(item.envelope.deadline);
                wake_at = Some(wake_at.map_or(wake, |w| w.min(wake)));
                i += 1;
            }
        }

        for item in &expired {
            self.pending_ids.remove(&item.envelope.id);
        }
        Scan {
            found: None,
            expired,
            wake_at,
        }
    }
}

/// Bounded multi-lane priority queue.
pub struct EnvelopeQueue {
    state: Mutex<QueueState>,
    capacity_per_tier: usize,
    notify: Notify,
    expired_tx: broadcast::Sender<ExpiredNotice>,
    telemetry: Telemetry,
}

impl EnvelopeQueue {
    pub fn new(capacity_per_tier: usize, notification_capacity: usize, telemetry: Telemetry) -> Self {
        let (expired_tx, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            state: Mutex::new(QueueState::new()),
            capacity_per_tier,
            notify: Notify::new(),
            expired_tx,
            telemetry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits an envelope.
    ///
    /// # Errors
    ///
    /// - `Validation` if the deadline has already passed, or a caller id
    ///   falls in the generated range
    /// - `DuplicateId` if an envelope with the same id is still pending
    /// - `QueueFull` if the envelope's tier is at capacity
    pub fn enqueue(&self, envelope: Envelope) -> Result<Ticket> {
        let now = Instant::now();
        if envelope.is_expired_at(now) {
            return Err(BrokerError::Validation(format!(
                "envelope {} deadline has already passed",
                envelope.id
            )));
        }
        if envelope.has_reserved_id() {
            return Err(BrokerError::Validation(format!(
                "caller-supplied id {} is in the generated id range",
                envelope.id
            )));
        }

        let priority = envelope.priority;
        let (queued, ticket) = QueuedEnvelope::new(envelope, now);
        let mut expired = Vec::new();
        {
            let mut state = self.lock();
            if state.pending_ids.contains(&queued.envelope.id) {
                return Err(BrokerError::DuplicateId(queued.envelope.id));
            }

            // Expired envelopes must not hold capacity. Only a full lane is
            // scanned, so admission stays O(1) otherwise.
            if state.lanes[priority.lane()].len() >= self.capacity_per_tier {
                QueueState::take_expired(&mut state.lanes[priority.lane()], now, &mut expired);
                for item in &expired {
                    state.pending_ids.remove(&item.envelope.id);
                }
            }

            if state.lanes[priority.lane()].len() >= self.capacity_per_tier {
                drop(state);
                self.report_expired(expired, now);
                return Err(BrokerError::QueueFull(priority));
            }

            state.pending_ids.insert(queued.envelope.id);
            state.insert_ordered(queued);
        }

        self.report_expired(expired, now);
        self.notify.notify_one();
        Ok(ticket)
    }

    /// Puts a retry back in its lane. The id stays pending.
    ///
    /// Gives the envelope back if the tier is full.
    pub(crate) fn requeue(&self, item: QueuedEnvelope) -> std::result::Result<(), QueuedEnvelope> {
        {
            let mut state = self.lock();
            let lane = item.envelope.priority.lane();
            if state.lanes[lane].len() >= self.capacity_per_tier {
                return Err(item);
            }
            state.insert_ordered(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits until an eligible envelope exists and removes it.
    pub async fn dequeue(&self) -> QueuedEnvelope {
        loop {
            let now = Instant::now();
            let scan = self.lock().scan(now);
            self.report_expired(scan.expired, now);

            if let Some(item) = scan.found {
                return item;
            }

            match scan.wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Removes an eligible envelope if one exists, without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedEnvelope> {
        let now = Instant::now();
        let scan = self.lock().scan(now);
        self.report_expired(scan.expired, now);
        scan.found
    }

    /// Marks an envelope id terminal so it may be reused.
    pub fn release(&self, id: EnvelopeId) {
        self.lock().pending_ids.remove(&id);
    }

    /// Drops every expired envelope. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut state = self.lock();
            for lane in state.lanes.iter_mut() {
                QueueState::take_expired(lane, now, &mut expired);
            }
            for item in &expired {
                state.pending_ids.remove(&item.envelope.id);
            }
        }
        let count = expired.len();
        self.report_expired(expired, now);
        count
    }

    pub fn len(&self) -> usize {
        self.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tier_len(&self, priority: Priority) -> usize {
        self.lock().lanes[priority.lane()].len()
    }

    pub fn capacity_per_tier(&self) -> usize {
        self.capacity_per_tier
    }

    pub fn depths(&self) -> QueueDepths {
        let state = self.lock();
        QueueDepths {
            critical: state.lanes[Priority::Critical.lane()].len(),
            high: state.lanes[Priority::High.lane()].len(),
            normal: state.lanes[Priority::Normal.lane()].len(),
            low: state.lanes[Priority::Low.lane()].len(),
            pending: state.pending_ids.len(),
        }
    }

    /// Subscribes to expiry notices emitted from now on.
    pub fn subscribe_expired(&self) -> broadcast::Receiver<ExpiredNotice> {
        self.expired_tx.subscribe()
    }

    /// Reports an envelope that expired outside the queue (e.g. before its
    /// first attempt).
    pub(crate) fn notify_expired(&self, envelope: &Envelope) {
        let now = Instant::now();
        let _ = self.expired_tx.send(ExpiredNotice::for_envelope(envelope, now));
        self.telemetry
            .outcome(&envelope.recipient.telemetry_key(), CallOutcome::Expired);
    }

    fn report_expired(&self, expired: Vec<QueuedEnvelope>, now: Instant) {
        for item in expired {
            warn!(
                "Envelope {} to {} expired in the {} lane after {:?}",
                item.envelope.id,
                item.envelope.recipient,
                item.envelope.priority,
                now.saturating_duration_since(item.envelope.created_at)
            );
            // No subscribers is fine
            let _ = self
                .expired_tx
                .send(ExpiredNotice::for_envelope(&item.envelope, now));
            self.telemetry
                .outcome(&item.envelope.recipient.telemetry_key(), CallOutcome::Expired);
            let id = item.envelope.id;
            item.complete(Err(BrokerError::Expired(id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn queue(capacity: usize) -> EnvelopeQueue {
        EnvelopeQueue::new(capacity, 16, Telemetry::noop())
    }

    fn envelope(priority: Priority) -> Envelope {
        Envelope::new("coordinator", Recipient::Worker("w".into()), json!(null))
            .with_priority(priority)
    }

    #[test]
    fn test_dequeue_order_by_priority() {
        let q = queue(8);
        let low = envelope(Priority::Low);
        let critical = envelope(Priority::Critical);
        let normal = envelope(Priority::Normal);
        let ids = (low.id, critical.id, normal.id);

        q.enqueue(low).unwrap();
        q.enqueue(critical).unwrap();
        q.enqueue(normal).unwrap();

        assert_eq!(q.try_dequeue().unwrap().envelope.id, ids.1);
        assert_eq!(q.try_dequeue().unwrap().envelope.id, ids.2);
        assert_eq!(q.try_dequeue().unwrap().envelope.id, ids.0);
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let q = queue(8);
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let env = envelope(Priority::High);
                let id = env.id;
                q.enqueue(env).unwrap();
                id
            })
            .collect();

        let popped: Vec<_> = std::iter::from_fn(|| q.try_dequeue().map(|i| i.envelope.id)).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_enqueue_rejects_expired_envelope() {
        let q = queue(8);
        let env = envelope(Priority::Normal).with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(q.enqueue(env), Err(BrokerError::Validation(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn test_enqueue_rejects_duplicate_pending_id() {
        let q = queue(8);
        q.enqueue(envelope(Priority::Normal).with_id(42)).unwrap();
        assert!(matches!(
            q.enqueue(envelope(Priority::Low).with_id(42)),
            Err(BrokerError::DuplicateId(42))
        ));

        // Still pending while in flight
        let _in_flight = q.try_dequeue().unwrap();
        assert!(q.enqueue(envelope(Priority::Low).with_id(42)).is_err());

        q.release(42);
        assert!(q.enqueue(envelope(Priority::Low).with_id(42)).is_ok());
    }

    #[test]
    fn test_queue_full_then_capacity_freed() {
        let q = queue(2);
        q.enqueue(envelope(Priority::Normal)).unwrap();
        q.enqueue(envelope(Priority::Normal)).unwrap();

        let err = q.enqueue(envelope(Priority::Normal)).unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull(Priority::Normal)));
        assert!(err.is_backpressure());

        // Other tiers are unaffected
        q.enqueue(envelope(Priority::Low)).unwrap();

        let _ = q.try_dequeue().unwrap();
        assert!(q.enqueue(envelope(Priority::Normal)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_envelope_is_never_dequeued() {
        let q = queue(8);
        let mut notices = q.subscribe_expired();

        let short = envelope(Priority::Critical).with_ttl(Duration::from_millis(10));
        let short_id = short.id;
        let ticket = q.enqueue(short).unwrap();
        let long = envelope(Priority::Low);
        let long_id = long.id;
        q.enqueue(long).unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(q.try_dequeue().unwrap().envelope.id, long_id);
        assert!(matches!(ticket.wait().await, Err(BrokerError::Expired(id)) if id == short_id));

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.envelope_id, short_id);
        assert_eq!(notice.priority, Priority::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lane_makes_room_by_dropping_expired() {
        let q = queue(2);
        let mut notices = q.subscribe_expired();
        let short = envelope(Priority::High).with_ttl(Duration::from_millis(5));
        let short_id = short.id;
        q.enqueue(short).unwrap();

        // Not full yet: the expired entry is left for dequeue or the sweeper
        tokio::time::advance(Duration::from_millis(10)).await;
        q.enqueue(envelope(Priority::High)).unwrap();
        assert_eq!(q.tier_len(Priority::High), 2);

        // Full: the expired entry gives up its slot
        q.enqueue(envelope(Priority::High)).unwrap();
        assert_eq!(q.tier_len(Priority::High), 2);
        assert_eq!(notices.recv().await.unwrap().envelope_id, short_id);
    }

    #[test]
    fn test_enqueue_rejects_caller_id_in_generated_range() {
        let q = queue(8);
        let env = envelope(Priority::Normal).with_id(a2a_common::GENERATED_ID_FLAG | 3);
        assert!(matches!(q.enqueue(env), Err(BrokerError::Validation(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn test_caller_id_does_not_block_generated_ids() {
        let q = queue(8);
        let raw_next = a2a_common::next_envelope_id() & !a2a_common::GENERATED_ID_FLAG;
        q.enqueue(envelope(Priority::Normal).with_id(raw_next + 1)).unwrap();

        for _ in 0..4 {
            assert!(q.enqueue(envelope(Priority::Normal)).is_ok());
        }
    }

    #[test]
    fn test_ticket_debug_shows_id() {
        let q = queue(8);
        let env = envelope(Priority::Normal).with_id(77);
        let ticket = q.enqueue(env).unwrap();
        let debug = format!("{:?}", ticket);
        assert!(debug.contains("envelope_id: 77"));
        assert!(debug.contains("started: false"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let q = queue(8);
        for _ in 0..3 {
            q.enqueue(envelope(Priority::Normal).with_ttl(Duration::from_millis(5))).unwrap();
        }
        q.enqueue(envelope(Priority::Normal)).unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(q.purge_expired(), 3);
        assert_eq!(q.len(), 1);
        assert_eq!(q.depths().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_waits_for_enqueue() {
        let q = Arc::new(queue(8));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await.envelope.id })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let env = envelope(Priority::Normal);
        let id = env.id;
        q.enqueue(env).unwrap();
        assert_eq!(waiter.await.unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_retry_waits_for_backoff_floor() {
        let q = queue(8);
        let env = envelope(Priority::Normal);
        let id = env.id;
        q.enqueue(env).unwrap();

        let item = q.try_dequeue().unwrap();
        let (envelope, completion) = item.into_parts();
        let now = Instant::now();
        let retry = QueuedEnvelope::from_parts(envelope, completion, now, now + Duration::from_millis(100));
        assert!(q.requeue(retry).is_ok());

        assert!(q.try_dequeue().is_none());
        let start = Instant::now();
        let item = q.dequeue().await;
        assert_eq!(item.envelope.id, id);
        assert!(Instant::now() - start >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_created_at_order() {
        let q = queue(8);
        let first = envelope(Priority::Normal);
        let first_id = first.id;
        q.enqueue(first).unwrap();
        let item = q.try_dequeue().unwrap();

        tokio::time::advance(Duration::from_millis(1)).await;
        let second = envelope(Priority::Normal);
        let second_id = second.id;
        q.enqueue(second).unwrap();

        let (envelope, completion) = item.into_parts();
        let now = Instant::now();
        q.requeue(QueuedEnvelope::from_parts(envelope, completion, now, now)).ok();

        assert_eq!(q.try_dequeue().unwrap().envelope.id, first_id);
        assert_eq!(q.try_dequeue().unwrap().envelope.id, second_id);
    }

    #[test]
    fn test_depths() {
        let q = queue(8);
        q.enqueue(envelope(Priority::Critical)).unwrap();
        q.enqueue(envelope(Priority::Low)).unwrap();
        q.enqueue(envelope(Priority::Low)).unwrap();
        let depths = q.depths();
        assert_eq!(depths.critical, 1);
        assert_eq!(depths.high, 0);
        assert_eq!(depths.low, 2);
        assert_eq!(depths.pending, 3);
        assert_eq!(q.tier_len(Priority::Low), 2);
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    proptest! {
        #[test]
        fn prop_never_dequeues_lower_tier_first(priorities in proptest::collection::vec(priority_strategy(), 1..40)) {
            let q = queue(64);
            for p in &priorities {
                q.enqueue(envelope(*p)).unwrap();
            }

            let mut popped = Vec::new();
            while let Some(item) = q.try_dequeue() {
                popped.push((item.envelope.priority, item.envelope.id));
            }

            prop_assert_eq!(popped.len(), priorities.len());
            for pair in popped.windows(2) {
                prop_assert!(pair[0].0 >= pair[1].0);
                if pair[0].0 == pair[1].0 {
                    prop_assert!(pair[0].1 < pair[1].1);
                }
            }
        }
    }
}
