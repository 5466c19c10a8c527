//! In-process transport backed by tokio channels.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Transport, TransportHandle};
use crate::protocol::{BrokerError, Envelope, Payload, Result};

/// One envelope handed to a worker, with the slot for its reply.
pub struct Delivery {
    pub envelope: Envelope,
    responder: oneshot::Sender<Result<Payload>>,
}

impl Delivery {
    /// Sends the worker's reply back to the broker.
    ///
    /// Returns `false` if nobody is waiting any more, which is normal when
    /// the reply is late and the transport task has been dropped.
    pub fn respond(self, result: Result<Payload>) -> bool {
        self.responder.send(result).is_ok()
    }
}

/// Receiving side of a [`ChannelTransport`], owned by the worker.
pub struct WorkerInbox {
    name: String,
    rx: mpsc::Receiver<Delivery>,
}

impl WorkerInbox {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Transport that hands envelopes to a worker task in the same process.
///
/// # Example
///
/// ```
/// use a2a_common::transport::{ChannelTransport, Transport};
/// use a2a_common::{Envelope, Recipient};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let (transport, _task) = ChannelTransport::spawn("echo", 16, |env: Envelope| async move {
///     Ok(env.payload)
/// });
/// let env = Envelope::new("coordinator", Recipient::Worker("echo".into()), json!(1));
/// assert_eq!(transport.send(env).await.unwrap(), json!(1));
/// # }
/// ```
#[derive(Clone)]
pub struct ChannelTransport {
    name: String,
    tx: mpsc::Sender<Delivery>,
}

impl ChannelTransport {
    /// Creates a transport and the inbox its worker reads from.
    pub fn pair(name: impl Into<String>, buffer: usize) -> (Self, WorkerInbox) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                name: name.clone(),
                tx,
            },
            WorkerInbox { name, rx },
        )
    }

    /// Creates a transport and spawns a worker task that runs `handler` for
    /// every delivery, each in its own task so slow requests do not block
    /// the inbox.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        buffer: usize,
        handler: F,
    ) -> (TransportHandle, JoinHandle<()>)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        let (transport, mut inbox) = Self::pair(name, buffer);
        let handler = Arc::new(handler);
        let task = tokio::spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let Delivery {
                        envelope,
                        responder,
                    } = delivery;
                    let result = handler(envelope).await;
                    let _ = responder.send(result);
                });
            }
            debug!("Worker inbox {} closed", inbox.name());
        });
        (Arc::new(transport), task)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<Payload> {
        let (responder, reply) = oneshot::channel();
        self.tx
            .send(Delivery {
                envelope,
                responder,
            })
            .await
            .map_err(|_| BrokerError::Transport(format!("worker inbox '{}' is closed", self.name)))?;

        reply.await.map_err(|_| {
            BrokerError::Transport(format!("worker '{}' dropped the request", self.name))
        })?
    }

    fn endpoint(&self) -> String {
        format!("channel://{}", self.name)
    }
}
