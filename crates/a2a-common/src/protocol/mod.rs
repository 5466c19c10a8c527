pub mod envelope;
pub mod error;
pub mod wire;
pub mod worker;


pub use envelope::{
    is_generated_id, next_correlation_id, next_envelope_id, CorrelationId, Envelope, EnvelopeId, Payload,
    Priority, Recipient, Response, DEFAULT_TTL, GENERATED_ID_FLAG,
};
pub use error::{BrokerError, Result};
pub use wire::{WireEnvelope, WireResponse};
pub use worker::{Capability, CircuitState, WorkerId, WorkerStatus};
