//! A2A Common Types and Transport
//!
//! Shared protocol definitions, the error taxonomy and the transport layer
//! for the agent-to-agent message broker.
//!
//! # Overview
//!
//! The broker routes task requests from a coordinating process to a set of
//! independently failing workers. This crate holds everything the broker,
//! the metrics crate and the CLI need to agree on:
//!
//! - **Protocol Layer**: envelopes, priorities, worker identities, capability
//!   tags, responses and the [`BrokerError`] taxonomy
//! - **Transport Layer**: the [`Transport`](transport::Transport) trait plus
//!   in-process channel and HTTP implementations
//! - **Telemetry**: the write-only [`TelemetrySink`](telemetry::TelemetrySink)
//!   interface
//!
//! # Example
//!
//! ```
//! use a2a_common::{Envelope, Priority, Recipient};
//! use serde_json::json;
//!
//! let envelope = Envelope::new("coordinator", Recipient::Worker("coach".into()), json!({"goal": "5k"}))
//!     .with_priority(Priority::Critical);
//! assert_eq!(envelope.priority, Priority::Critical);
//! ```

pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use protocol::*;
