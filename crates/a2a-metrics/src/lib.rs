//! A2A Metrics Collection
//!
//! Telemetry sinks for the A2A broker. The broker only ever writes to a
//! [`TelemetrySink`](a2a_common::telemetry::TelemetrySink); this crate
//! provides sinks that do something useful with those events.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free per-worker counters and latency histograms
//! - [`MetricsTelemetry`]: sink that feeds a registry and hands out snapshots
//! - [`TracingTelemetry`]: sink that logs every event through `tracing`
//! - [`FanOutTelemetry`]: sink that forwards to several sinks
//! - [`MetricsSnapshot`]: serializable view of the registry
//!
//! # Usage Example
//!
//! ```rust
//! use a2a_metrics::MetricsTelemetry;
//! use a2a_common::telemetry::{Operation, TelemetrySink};
//! use a2a_common::protocol::WorkerId;
//! use std::time::Duration;
//!
//! let telemetry = MetricsTelemetry::new();
//! telemetry.record_latency(&WorkerId::from("coach"), Operation::Send, Duration::from_millis(8));
//!
//! let snapshot = telemetry.snapshot();
//! assert_eq!(snapshot.workers["coach"].send_latency.count, 1);
//! ```
//!
//! # Thread Safety
//!
//! Counter updates are atomic increments. The worker map is behind an
//! `RwLock` that is only written the first time a worker is seen.

mod collector;
mod registry;
mod snapshot;

pub use collector::{FanOutTelemetry, MetricsTelemetry, TracingTelemetry};
pub use registry::MetricsRegistry;
pub use snapshot::{LatencyMetrics, MetricsSnapshot, OutcomeCounts, WorkerMetrics};
