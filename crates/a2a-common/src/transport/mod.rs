//! A2A Transport Layer
//!
//! The broker depends only on the [`Transport`] trait: given an envelope, a
//! transport delivers it to one worker and resolves to the worker's payload
//! or an error. How the bytes travel is up to the implementation.
//!
//! # Components
//!
//! - **[`Transport`]** / **[`TransportHandle`]**: the send contract
//! - **[`ChannelTransport`]**: in-process delivery over a bounded tokio channel
//! - **[`HttpTransport`]**: JSON over HTTP POST to a worker URL
//!
//! # Late replies
//!
//! The dispatcher runs every `send` in its own task and may stop waiting
//! before the future resolves. Implementations must therefore not rely on
//! being polled to completion by the caller, and should bound their own
//! lifetime (the HTTP transport applies a request timeout).

pub mod channel;
pub mod http;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::{Envelope, Payload, Result};

pub use channel::{ChannelTransport, Delivery, WorkerInbox};
pub use http::HttpTransport;

/// Delivers envelopes to a single worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the envelope and waits for the worker's reply.
    async fn send(&self, envelope: Envelope) -> Result<Payload>;

    /// Human-readable description of where this transport delivers to.
    fn endpoint(&self) -> String;
}

/// Shared handle to a worker's transport, stored in the registry.
pub type TransportHandle = Arc<dyn Transport>;
