//! Background housekeeping for breakers, drains and the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::queue::EnvelopeQueue;
use crate::registry::WorkerRegistry;

/// Periodically moves cooled-down breakers to HALF_OPEN, finishes worker
/// drains and purges expired envelopes.
///
/// Dispatch performs the same cool-down check on admission, so the sweeper
/// only makes transitions visible sooner.
pub(crate) struct Sweeper {
    registry: Arc<WorkerRegistry>,
    queue: Arc<EnvelopeQueue>,
    interval: Duration,
}

impl Sweeper {
    pub(crate) fn new(registry: Arc<WorkerRegistry>, queue: Arc<EnvelopeQueue>, interval: Duration) -> Self {
        Self {
            registry,
            queue,
            interval,
        }
    }

    /// Starts the sweeper task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.sweep_once(Instant::now());
        }
    }

    fn sweep_once(&self, now: Instant) {
        let half_opened = self.registry.sweep(now);
        let purged = self.queue.purge_expired();
        if half_opened > 0 || purged > 0 {
            debug!(
                "Sweep moved {} breaker(s) to half-open, purged {} expired envelope(s)",
                half_opened, purged
            );
        }
    }
}
