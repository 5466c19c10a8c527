//! Worker registry and router.
//!
//! Maps each worker identity to its transport handle, capability tags and
//! circuit breaker. Breakers live in the registry, one per identity, each
//! behind its own lock so that calls to one worker never contend with calls
//! to another.

use a2a_common::protocol::{
    BrokerError, Capability, CircuitState, Recipient, Result, WorkerId, WorkerStatus,
};
use a2a_common::transport::TransportHandle;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, Transition};
use crate::config::CircuitBreakerConfig;
use crate::telemetry::Telemetry;

/// Everything a worker supplies when it joins the broker.
#[derive(Clone)]
pub struct WorkerRegistration {
    pub id: WorkerId,
    pub capabilities: BTreeSet<Capability>,
    pub transport: TransportHandle,
    /// Overrides the broker-wide breaker settings for this worker
    pub breaker_config: Option<CircuitBreakerConfig>,
}

impl WorkerRegistration {
    pub fn new(
        id: impl Into<WorkerId>,
        capabilities: impl IntoIterator<Item = Capability>,
        transport: TransportHandle,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            transport,
            breaker_config: None,
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }
}

/// A breaker state change, as published on the transitions stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerTransition {
    pub worker: WorkerId,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// A worker returned by [`WorkerRegistry::resolve`].
#[derive(Clone)]
pub struct ResolvedWorker {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub transport: TransportHandle,
}

impl std::fmt::Debug for ResolvedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedWorker")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("endpoint", &self.transport.endpoint())
            .finish()
    }
}

/// Serializable view of one registered worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub capabilities: Vec<Capability>,
    pub endpoint: String,
    pub in_flight: usize,
    pub breaker: BreakerSnapshot,
}

struct WorkerRecord {
    status: WorkerStatus,
    capabilities: BTreeSet<Capability>,
    transport: TransportHandle,
}

/// Registry entry: the registration record plus its breaker.
pub(crate) struct WorkerEntry {
    id: WorkerId,
    record: RwLock<WorkerRecord>,
    breaker: Mutex<CircuitBreaker>,
    in_flight: AtomicUsize,
}

impl WorkerEntry {
    fn new(registration: WorkerRegistration, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            id: registration.id,
            record: RwLock::new(WorkerRecord {
                status: WorkerStatus::Active,
                capabilities: registration.capabilities,
                transport: registration.transport,
            }),
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> &WorkerId {
        &self.id
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.read_record().status
    }

    pub(crate) fn transport(&self) -> TransportHandle {
        self.read_record().transport.clone()
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.read_record().capabilities.contains(&capability)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Counts a call as in flight until the returned guard drops.
    pub(crate) fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { entry: self.clone() }
    }

    fn resolved(&self) -> ResolvedWorker {
        let record = self.read_record();
        ResolvedWorker {
            id: self.id.clone(),
            status: record.status,
            transport: record.transport.clone(),
        }
    }

    /// Completes DRAINING -> REMOVED if nothing is in flight.
    fn try_finish_drain(&self) -> bool {
        let mut record = self.write_record();
        if record.status == WorkerStatus::Draining && self.in_flight() == 0 {
            record.status = WorkerStatus::Removed;
            info!("Worker {} drained and removed", self.id);
            return true;
        }
        false
    }

    fn read_record(&self) -> std::sync::RwLockReadGuard<'_, WorkerRecord> {
        self.record.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_record(&self) -> std::sync::RwLockWriteGuard<'_, WorkerRecord> {
        self.record.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a worker's in-flight count raised while a call is outstanding.
pub(crate) struct InFlightGuard {
    entry: Arc<WorkerEntry>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.entry.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.try_finish_drain();
        }
    }
}

/// Registry of workers keyed by identity.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<WorkerEntry>>>,
    default_breaker: CircuitBreakerConfig,
    /// Round-robin position per capability
    cursors: Mutex<HashMap<Capability, usize>>,
    transitions_tx: broadcast::Sender<BreakerTransition>,
    telemetry: Telemetry,
}

impl WorkerRegistry {
    pub fn new(
        default_breaker: CircuitBreakerConfig,
        notification_capacity: usize,
        telemetry: Telemetry,
    ) -> Self {
        let (transitions_tx, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            workers: RwLock::new(HashMap::new()),
            default_breaker,
            cursors: Mutex::new(HashMap::new()),
            transitions_tx,
            telemetry,
        }
    }

    /// Registers a worker, or refreshes an existing registration.
    ///
    /// Re-registering an ACTIVE or DRAINING worker swaps in the new handle and
    /// capabilities and sets it ACTIVE. Its breaker keeps its state and
    /// counters; a `breaker_config` override replaces the breaker's
    /// thresholds, while no override leaves them untouched. A REMOVED worker
    /// starts over with a fresh breaker.
    pub fn register(&self, registration: WorkerRegistration) -> Result<()> {
        let breaker_config = registration
            .breaker_config
            .clone()
            .unwrap_or_else(|| self.default_breaker.clone());
        breaker_config.validate()?;

        let mut workers = self.write_workers();
        if let Some(entry) = workers.get(&registration.id) {
            let mut record = entry.write_record();
            if record.status != WorkerStatus::Removed {
                record.status = WorkerStatus::Active;
                record.capabilities = registration.capabilities;
                record.transport = registration.transport;
                if registration.breaker_config.is_some() {
                    entry.lock_breaker().set_config(breaker_config);
                }
                info!("Worker {} re-registered", registration.id);
                return Ok(());
            }
        }

        info!(
            "Worker {} registered at {} with capabilities {:?}",
            registration.id,
            registration.transport.endpoint(),
            registration.capabilities
        );
        let id = registration.id.clone();
        workers.insert(id, Arc::new(WorkerEntry::new(registration, breaker_config)));
        Ok(())
    }

    /// Starts draining a worker. It becomes REMOVED once its in-flight calls
    /// finish, immediately if there are none.
    pub fn deregister(&self, id: &WorkerId) -> Result<WorkerStatus> {
        let entry = self
            .get(id)
            .ok_or_else(|| BrokerError::UnknownWorker(id.to_string()))?;

        {
            let mut record = entry.write_record();
            if record.status == WorkerStatus::Active {
                record.status = WorkerStatus::Draining;
                info!("Worker {} draining ({} calls in flight)", id, entry.in_flight());
            }
        }
        entry.try_finish_drain();
        Ok(entry.status())
    }

    pub(crate) fn get(&self, id: &WorkerId) -> Option<Arc<WorkerEntry>> {
        self.read_workers().get(id).cloned()
    }

    pub fn status(&self, id: &WorkerId) -> Option<WorkerStatus> {
        self.get(id).map(|entry| entry.status())
    }

    pub fn breaker_state(&self, id: &WorkerId) -> Option<CircuitState> {
        self.get(id).map(|entry| entry.lock_breaker().state())
    }

    pub fn len(&self) -> usize {
        self.read_workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a recipient to the workers that should receive it.
    ///
    /// Explicit identities resolve whatever their status; the dispatcher
    /// rejects non-ACTIVE ones. Capability routing only yields ACTIVE
    /// workers.
    pub fn resolve(&self, recipient: &Recipient) -> Result<Vec<ResolvedWorker>> {
        match recipient {
            Recipient::Worker(id) => self
                .get(id)
                .map(|entry| vec![entry.resolved()])
                .ok_or_else(|| BrokerError::UnknownWorker(id.to_string())),
            Recipient::Workers(ids) => ids
                .iter()
                .map(|id| {
                    self.get(id)
                        .map(|entry| entry.resolved())
                        .ok_or_else(|| BrokerError::UnknownWorker(id.to_string()))
                })
                .collect(),
            Recipient::Capability(capability) => {
                let candidates = self.active_with(*capability);
                if candidates.is_empty() {
                    return Err(BrokerError::UnknownWorker(format!(
                        "no active worker with capability {}",
                        capability
                    )));
                }
                Ok(candidates.iter().map(|entry| entry.resolved()).collect())
            }
        }
    }

    /// ACTIVE workers with a capability, ordered by identity.
    fn active_with(&self, capability: Capability) -> Vec<Arc<WorkerEntry>> {
        let mut candidates: Vec<_> = self
            .read_workers()
            .values()
            .filter(|entry| entry.status() == WorkerStatus::Active && entry.has_capability(capability))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Picks the next worker for a capability in round-robin order and
    /// admits the call through its breaker.
    ///
    /// Workers whose breaker rejects are skipped. If all of them reject, the
    /// error names the first candidate tried.
    pub(crate) fn select(
        &self,
        capability: Capability,
        now: Instant,
    ) -> Result<(Arc<WorkerEntry>, Admission)> {
        let candidates = self.active_with(capability);
        if candidates.is_empty() {
            return Err(BrokerError::UnknownWorker(format!(
                "no active worker with capability {}",
                capability
            )));
        }

        let start = {
            let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
            let cursor = cursors.entry(capability).or_insert(0);
            let start = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            start
        };

        let mut first_rejected = None;
        for offset in 0..candidates.len() {
            let entry = &candidates[(start + offset) % candidates.len()];
            match self.acquire(entry, now) {
                Ok(admission) => return Ok((entry.clone(), admission)),
                Err(e) => {
                    first_rejected.get_or_insert(e);
                }
            }
        }

        Err(first_rejected.unwrap_or_else(|| BrokerError::CircuitOpen(candidates[start].id.clone())))
    }

    /// Asks a worker's breaker to admit a call.
    pub(crate) fn acquire(&self, entry: &WorkerEntry, now: Instant) -> Result<Admission> {
        let (result, transitions) = {
            let mut breaker = entry.lock_breaker();
            let result = breaker.try_acquire(now);
            (result, breaker.drain_transitions())
        };
        self.publish(&entry.id, transitions);
        result.map_err(|_| BrokerError::CircuitOpen(entry.id.clone()))
    }

    pub(crate) fn record_success(&self, entry: &WorkerEntry, admission: Admission, now: Instant) {
        let transitions = {
            let mut breaker = entry.lock_breaker();
            breaker.record_success(admission, now);
            breaker.drain_transitions()
        };
        self.publish(&entry.id, transitions);
    }

    pub(crate) fn record_failure(&self, entry: &WorkerEntry, admission: Admission, now: Instant) {
        let transitions = {
            let mut breaker = entry.lock_breaker();
            breaker.record_failure(admission, now);
            breaker.drain_transitions()
        };
        self.publish(&entry.id, transitions);
    }

    pub(crate) fn record_late_success(&self, entry: &WorkerEntry) {
        entry.lock_breaker().record_late_success();
    }

    /// Housekeeping pass: moves cooled-down breakers to HALF_OPEN and
    /// finishes drains. Returns the number of breakers moved.
    pub fn sweep(&self, now: Instant) -> usize {
        let entries: Vec<_> = self.read_workers().values().cloned().collect();
        let mut moved = 0;
        for entry in entries {
            let transitions = {
                let mut breaker = entry.lock_breaker();
                if breaker.poll_cool_down(now) {
                    moved += 1;
                }
                breaker.drain_transitions()
            };
            self.publish(&entry.id, transitions);
            entry.try_finish_drain();
        }
        moved
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions_tx.subscribe()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<_> = self
            .read_workers()
            .values()
            .map(|entry| {
                let record = entry.read_record();
                WorkerSnapshot {
                    id: entry.id.clone(),
                    status: record.status,
                    capabilities: record.capabilities.iter().copied().collect(),
                    endpoint: record.transport.endpoint(),
                    in_flight: entry.in_flight(),
                    breaker: entry.lock_breaker().snapshot(now),
                }
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    fn publish(&self, worker: &WorkerId, transitions: Vec<Transition>) {
        for Transition { from, to } in transitions {
            match to {
                CircuitState::Open => warn!("Circuit for worker {} opened ({:?} -> {:?})", worker, from, to),
                _ => info!("Circuit for worker {} moved {:?} -> {:?}", worker, from, to),
            }
            self.telemetry.transition(worker, from, to);
            let _ = self.transitions_tx.send(BreakerTransition {
                worker: worker.clone(),
                from,
                to,
            });
        }
    }

    fn read_workers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<WorkerId, Arc<WorkerEntry>>> {
        self.workers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_workers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<WorkerId, Arc<WorkerEntry>>> {
        self.workers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a2a_common::protocol::{Envelope, Payload};
    use a2a_common::transport::Transport;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullTransport(&'static str);

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _envelope: Envelope) -> Result<Payload> {
            Ok(Payload::Null)
        }

        fn endpoint(&self) -> String {
            format!("null://{}", self.0)
        }
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                cool_down: Duration::from_secs(1),
                half_open_trial_count: 1,
            },
            16,
            Telemetry::noop(),
        )
    }

    fn registration(id: &str, caps: &[Capability]) -> WorkerRegistration {
        WorkerRegistration::new(id, caps.iter().copied(), Arc::new(NullTransport("x")))
    }

    fn trip(registry: &WorkerRegistry, id: &str) {
        let entry = registry.get(&id.into()).unwrap();
        let now = Instant::now();
        for _ in 0..2 {
            let admission = registry.acquire(&entry, now).unwrap();
            registry.record_failure(&entry, admission, now);
        }
    }

    #[test]
    fn test_register_and_resolve_by_identity() {
        let registry = registry();
        registry.register(registration("coach", &[Capability::Coaching])).unwrap();

        let resolved = registry.resolve(&Recipient::Worker("coach".into())).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id.as_str(), "coach");
        assert_eq!(resolved[0].status, WorkerStatus::Active);
    }

    #[test]
    fn test_resolve_unknown_worker() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&Recipient::Worker("ghost".into())),
            Err(BrokerError::UnknownWorker(_))
        ));
        assert!(matches!(
            registry.resolve(&Recipient::Capability(Capability::Nutrition)),
            Err(BrokerError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_resolve_capability_only_active() {
        let registry = registry();
        registry.register(registration("a", &[Capability::Biometrics])).unwrap();
        registry.register(registration("b", &[Capability::Biometrics, Capability::Recovery])).unwrap();
        registry.register(registration("c", &[Capability::Recovery])).unwrap();
        registry.deregister(&"a".into()).unwrap();

        let resolved = registry.resolve(&Recipient::Capability(Capability::Biometrics)).unwrap();
        let ids: Vec<_> = resolved.iter().map(|w| w.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_twice_keeps_breaker_state() {
        let registry = registry();
        registry.register(registration("w", &[Capability::Training])).unwrap();
        trip(&registry, "w");
        assert_eq!(registry.breaker_state(&"w".into()), Some(CircuitState::Open));

        registry.register(registration("w", &[Capability::Training])).unwrap();
        assert_eq!(registry.status(&"w".into()), Some(WorkerStatus::Active));
        assert_eq!(registry.breaker_state(&"w".into()), Some(CircuitState::Open));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_live_worker_applies_breaker_override() {
        let registry = registry();
        registry.register(registration("w", &[])).unwrap();
        let entry = registry.get(&"w".into()).unwrap();
        let now = Instant::now();
        let admission = registry.acquire(&entry, now).unwrap();
        registry.record_failure(&entry, admission, now);

        let override_config = CircuitBreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_secs(5),
            half_open_trial_count: 1,
        };
        registry
            .register(registration("w", &[]).with_breaker_config(override_config))
            .unwrap();

        // Same entry, failure count carried over, new threshold in force
        let entry = registry.get(&"w".into()).unwrap();
        assert_eq!(entry.lock_breaker().consecutive_failures(), 1);
        assert_eq!(entry.lock_breaker().config().failure_threshold, 3);

        let admission = registry.acquire(&entry, now).unwrap();
        registry.record_failure(&entry, admission, now);
        assert_eq!(registry.breaker_state(&"w".into()), Some(CircuitState::Closed));

        let admission = registry.acquire(&entry, now).unwrap();
        registry.record_failure(&entry, admission, now);
        assert_eq!(registry.breaker_state(&"w".into()), Some(CircuitState::Open));

        // Without an override the thresholds stay as they are
        registry.register(registration("w", &[])).unwrap();
        assert_eq!(entry.lock_breaker().config().cool_down, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_removed_worker_gets_fresh_breaker() {
        let registry = registry();
        registry.register(registration("w", &[])).unwrap();
        trip(&registry, "w");
        assert_eq!(registry.deregister(&"w".into()).unwrap(), WorkerStatus::Removed);

        registry.register(registration("w", &[])).unwrap();
        assert_eq!(registry.breaker_state(&"w".into()), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_deregister_waits_for_in_flight() {
        let registry = registry();
        registry.register(registration("w", &[])).unwrap();
        let entry = registry.get(&"w".into()).unwrap();

        let guard = entry.begin_call();
        assert_eq!(registry.deregister(&"w".into()).unwrap(), WorkerStatus::Draining);

        drop(guard);
        assert_eq!(registry.status(&"w".into()), Some(WorkerStatus::Removed));
    }

    #[test]
    fn test_deregister_unknown() {
        let registry = registry();
        assert!(matches!(
            registry.deregister(&"ghost".into()),
            Err(BrokerError::UnknownWorker(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_round_robin_skips_open_breakers() {
        let registry = registry();
        for id in ["a", "b", "c"] {
            registry.register(registration(id, &[Capability::Scheduling])).unwrap();
        }
        trip(&registry, "b");

        let now = Instant::now();
        let picks: Vec<_> = (0..4)
            .map(|_| registry.select(Capability::Scheduling, now).unwrap().0.id().as_str().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "c", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_all_open_reports_circuit_open() {
        let registry = registry();
        registry.register(registration("a", &[Capability::Summarization])).unwrap();
        trip(&registry, "a");

        assert!(matches!(
            registry.select(Capability::Summarization, Instant::now()),
            Err(BrokerError::CircuitOpen(id)) if id.as_str() == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published() {
        let registry = registry();
        let mut events = registry.subscribe_transitions();
        registry.register(registration("w", &[])).unwrap();
        trip(&registry, "w");

        let event = events.recv().await.unwrap();
        assert_eq!(event.worker.as_str(), "w");
        assert_eq!((event.from, event.to), (CircuitState::Closed, CircuitState::Open));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.sweep(Instant::now()), 1);
        let event = events.recv().await.unwrap();
        assert_eq!((event.from, event.to), (CircuitState::Open, CircuitState::HalfOpen));
    }

    #[test]
    fn test_register_rejects_invalid_breaker_override() {
        let registry = registry();
        let reg = registration("w", &[]).with_breaker_config(CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        });
        assert!(matches!(registry.register(reg), Err(BrokerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_lists_workers_sorted() {
        let registry = registry();
        registry.register(registration("zeta", &[Capability::Coaching])).unwrap();
        registry.register(registration("alpha", &[])).unwrap();

        let snapshot = registry.snapshot(Instant::now());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id.as_str(), "alpha");
        assert_eq!(snapshot[1].capabilities, vec![Capability::Coaching]);
        assert_eq!(snapshot[1].breaker.state, CircuitState::Closed);
        assert_eq!(snapshot[1].endpoint, "null://x");
    }
}
