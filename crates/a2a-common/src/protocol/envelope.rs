//! Message envelopes routed through the broker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::error::BrokerError;
use super::worker::{Capability, WorkerId};

pub type EnvelopeId = u64;
pub type CorrelationId = u64;

/// Opaque payload carried by an envelope. The broker never inspects it.
pub type Payload = serde_json::Value;

/// Time-to-live applied when the caller does not set one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

static ENVELOPE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CORRELATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// High bit set on every generated envelope id. Caller-supplied ids must
/// leave it clear, so the two never collide.
pub const GENERATED_ID_FLAG: EnvelopeId = 1 << 63;

/// Generates an envelope id unique for the lifetime of the process.
pub fn next_envelope_id() -> EnvelopeId {
    GENERATED_ID_FLAG | ENVELOPE_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Whether `id` lies in the range reserved for generated ids.
pub fn is_generated_id(id: EnvelopeId) -> bool {
    id & GENERATED_ID_FLAG != 0
}

/// Generates a correlation id for a fan-out call.
pub fn next_correlation_id() -> CorrelationId {
    CORRELATION_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Message priority. `Critical` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All priorities, highest first. This is the dequeue scan order.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Number of priority tiers.
    pub const COUNT: usize = 4;

    /// Index of this priority's queue lane.
    pub fn lane(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::DESCENDING
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BrokerError::Validation(format!("unknown priority '{}'", s)))
    }
}

/// Who should receive an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single named worker
    Worker(WorkerId),
    /// A set of named workers (fan-out)
    Workers(Vec<WorkerId>),
    /// Any active worker declaring the capability
    Capability(Capability),
}

impl Recipient {
    /// Key under which telemetry for this recipient is recorded when no
    /// concrete worker has been resolved.
    pub fn telemetry_key(&self) -> WorkerId {
        match self {
            Recipient::Worker(id) => id.clone(),
            Recipient::Workers(ids) => WorkerId::new(format!(
                "fanout:{}",
                ids.iter().map(WorkerId::as_str).collect::<Vec<_>>().join(",")
            )),
            Recipient::Capability(cap) => WorkerId::new(format!("capability:{}", cap)),
        }
    }

    pub fn is_fan_out(&self) -> bool {
        matches!(self, Recipient::Workers(_))
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Worker(id) => write!(f, "{}", id),
            Recipient::Workers(ids) => {
                let names: Vec<&str> = ids.iter().map(WorkerId::as_str).collect();
                write!(f, "[{}]", names.join(", "))
            }
            Recipient::Capability(cap) => write!(f, "capability:{}", cap),
        }
    }
}

/// The unit of work routed through the broker.
///
/// Envelopes are immutable once enqueued, apart from `attempt_count`, which
/// the dispatcher bumps when it re-enqueues a retry.
///
/// # Example
///
/// ```
/// use a2a_common::protocol::{Envelope, Priority, Recipient};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let envelope = Envelope::new("coordinator", Recipient::Worker("coach".into()), json!({"q": 1}))
///     .with_priority(Priority::High)
///     .with_ttl(Duration::from_secs(5));
/// assert_eq!(envelope.attempt_count, 0);
/// ```
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub sender: WorkerId,
    pub recipient: Recipient,
    pub priority: Priority,
    pub payload: Payload,
    pub created_at: Instant,
    pub deadline: Instant,
    pub attempt_count: u32,
    pub correlation_id: Option<CorrelationId>,
    caller_id: bool,
}

impl Envelope {
    /// Creates an envelope with a generated id, `Normal` priority and the
    /// default TTL.
    pub fn new(sender: impl Into<WorkerId>, recipient: Recipient, payload: Payload) -> Self {
        let created_at = Instant::now();
        Self {
            id: next_envelope_id(),
            sender: sender.into(),
            recipient,
            priority: Priority::default(),
            payload,
            created_at,
            deadline: created_at + DEFAULT_TTL,
            attempt_count: 0,
            correlation_id: None,
            caller_id: false,
        }
    }

    /// Replaces the generated id with a caller-supplied one.
    ///
    /// Caller ids must be below [`GENERATED_ID_FLAG`]; the broker rejects
    /// the rest at enqueue with `Validation`.
    pub fn with_id(mut self, id: EnvelopeId) -> Self {
        self.id = id;
        self.caller_id = true;
        self
    }

    /// Whether the id was set with [`with_id`](Self::with_id).
    pub fn has_caller_id(&self) -> bool {
        self.caller_id
    }

    /// A caller id that strays into the generated range.
    pub fn has_reserved_id(&self) -> bool {
        self.caller_id && is_generated_id(self.id)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets `deadline = created_at + ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.deadline = self.created_at + ttl;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.deadline.saturating_duration_since(self.created_at)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before the deadline, or `None` once it has passed.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        if now >= self.deadline {
            None
        } else {
            Some(self.deadline - now)
        }
    }

    /// Builds the child envelope sent to one recipient of a fan-out call.
    ///
    /// The child gets a fresh id, the shared correlation id and the earlier
    /// of the template's deadline and `deadline`.
    pub fn child_for(
        &self,
        worker: WorkerId,
        correlation_id: CorrelationId,
        deadline: Instant,
    ) -> Envelope {
        Envelope {
            id: next_envelope_id(),
            sender: self.sender.clone(),
            recipient: Recipient::Worker(worker),
            priority: self.priority,
            payload: self.payload.clone(),
            created_at: Instant::now(),
            deadline: self.deadline.min(deadline),
            attempt_count: 0,
            correlation_id: Some(correlation_id),
            caller_id: false,
        }
    }
}

/// Response returned by a worker for one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub envelope_id: EnvelopeId,
    pub worker: WorkerId,
    pub payload: Payload,
}

impl Response {
    pub fn new(envelope_id: EnvelopeId, worker: WorkerId, payload: Payload) -> Self {
        Self {
            envelope_id,
            worker,
            payload,
        }
    }
}
