use thiserror::Error;

use super::envelope::{EnvelopeId, Priority};
use super::worker::WorkerId;

/// Every failure the broker can report.
///
/// Registry-level (`UnknownWorker`, `WorkerUnavailable`) and breaker-level
/// (`CircuitOpen`) rejections mean the call was never attempted. `QueueFull`
/// is the admission-control signal and should be treated as backpressure,
/// not as a per-call failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate envelope id: {0}")]
    DuplicateId(EnvelopeId),

    #[error("Queue full for priority {0}")]
    QueueFull(Priority),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(WorkerId),

    #[error("Circuit open for worker {0}")]
    CircuitOpen(WorkerId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Envelope {0} expired before dispatch")]
    Expired(EnvelopeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether the dispatcher may retry the call that produced this error.
    ///
    /// Only transport failures qualify. Timeouts consume the envelope's
    /// remaining deadline, and registry/breaker rejections are returned to
    /// the coordinator untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }

    /// Whether this error is the system-wide backpressure signal.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, BrokerError::QueueFull(_))
    }

    /// Whether the call was rejected before the transport was contacted.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownWorker(_)
                | BrokerError::WorkerUnavailable(_)
                | BrokerError::CircuitOpen(_)
                | BrokerError::Expired(_)
                | BrokerError::Validation(_)
                | BrokerError::DuplicateId(_)
                | BrokerError::QueueFull(_)
                | BrokerError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
