//! A2A Broker
//!
//! Routes envelopes from a coordinator to registered workers through a
//! bounded priority queue, with a circuit breaker per worker, bounded
//! retries and parallel fan-out with partial-result aggregation.
//!
//! Callers depend on the [`Broker`] trait; [`BrokerV1`] is the current
//! implementation.

pub mod aggregator;
pub mod broker;
pub mod circuit_breaker;
pub mod config;
mod dispatcher;
pub mod queue;
pub mod registry;
mod sweeper;
pub mod telemetry;

pub use aggregator::{AggregateResult, FailedCall};
pub use broker::{Broker, BrokerSnapshot, BrokerV1};
pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker};
pub use config::{BrokerConfig, CircuitBreakerConfig, RetryConfig};
pub use queue::{EnvelopeQueue, ExpiredNotice, QueueDepths, Ticket};
pub use registry::{BreakerTransition, ResolvedWorker, WorkerRegistration, WorkerRegistry, WorkerSnapshot};
pub use telemetry::Telemetry;
