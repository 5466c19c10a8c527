//! JSON wire types used by network transports.
//!
//! [`Envelope`](super::Envelope) holds monotonic instants that mean nothing
//! outside this process, so transports that leave the process send a
//! [`WireEnvelope`] carrying the remaining time budget instead.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::envelope::{CorrelationId, Envelope, EnvelopeId, Payload, Priority, Recipient};
use super::worker::WorkerId;

/// Envelope as sent to a remote worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    pub id: EnvelopeId,
    pub sender: WorkerId,
    pub recipient: Recipient,
    pub priority: Priority,
    pub payload: Payload,
    pub attempt: u32,
    pub correlation_id: Option<CorrelationId>,
    /// Milliseconds left before the envelope's deadline when it was sent
    pub remaining_ms: u64,
}

impl WireEnvelope {
    pub fn from_envelope(envelope: &Envelope, now: Instant) -> Self {
        Self {
            id: envelope.id,
            sender: envelope.sender.clone(),
            recipient: envelope.recipient.clone(),
            priority: envelope.priority,
            payload: envelope.payload.clone(),
            attempt: envelope.attempt_count,
            correlation_id: envelope.correlation_id,
            remaining_ms: envelope
                .remaining_at(now)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Reply from a remote worker.
///
/// # Example
///
/// ```
/// use a2a_common::protocol::WireResponse;
/// use serde_json::json;
///
/// let ok = WireResponse::success(json!({"plan": "rest"}));
/// assert!(ok.success);
///
/// let failed = WireResponse::error("model unavailable");
/// assert_eq!(failed.error.as_deref(), Some("model unavailable"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireResponse {
    /// Whether the worker handled the envelope
    pub success: bool,
    /// Result payload. `null` and a missing field both mean `Payload::Null`.
    #[serde(default)]
    pub payload: Payload,
    /// Error message (present on failure)
    pub error: Option<String>,
}

impl WireResponse {
    pub fn success(payload: Payload) -> Self {
        Self {
            success: true,
            payload,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Payload::Null,
            error: Some(message.into()),
        }
    }
}
