//! Demo HTTP worker
//!
//! Accepts a JSON [`WireEnvelope`] on `POST /envelope` and echoes its
//! payload back in a [`WireResponse`]. Failures and latency can be
//! injected so the broker's retry and breaker behavior is easy to watch
//! from the command line.

use a2a_common::protocol::{WireEnvelope, WireResponse};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Path the demo worker serves envelopes on.
pub const ENVELOPE_PATH: &str = "/envelope";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoWorkerOptions {
    /// Answer every Nth request with `503 Service Unavailable`
    pub fail_every: Option<u64>,
    /// Sleep this long before answering
    pub delay: Option<Duration>,
}

#[derive(Clone)]
struct DemoState {
    name: Arc<str>,
    options: DemoWorkerOptions,
    requests: Arc<AtomicU64>,
}

/// Builds the router for a demo worker called `name`.
pub fn router(name: &str, options: DemoWorkerOptions) -> Router {
    Router::new()
        .route(ENVELOPE_PATH, post(handle_envelope))
        .with_state(DemoState {
            name: Arc::from(name),
            options,
            requests: Arc::new(AtomicU64::new(0)),
        })
}

async fn handle_envelope(
    State(state): State<DemoState>,
    Json(envelope): Json<WireEnvelope>,
) -> (StatusCode, Json<WireResponse>) {
    let n = state.requests.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(
        worker = %state.name,
        envelope_id = envelope.id,
        attempt = envelope.attempt,
        remaining_ms = envelope.remaining_ms,
        "Received envelope"
    );

    if let Some(delay) = state.options.delay {
        tokio::time::sleep(delay).await;
    }

    if matches!(state.options.fail_every, Some(every) if every > 0 && n % every == 0) {
        tracing::warn!(worker = %state.name, request = n, "Injecting failure");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WireResponse::error("injected failure")),
        );
    }

    (
        StatusCode::OK,
        Json(WireResponse::success(json!({
            "worker": &*state.name,
            "envelope_id": envelope.id,
            "attempt": envelope.attempt,
            "echo": envelope.payload,
        }))),
    )
}

/// Serves a demo worker on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, name: &str, options: DemoWorkerOptions) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Demo worker {} listening on http://{}{}", name, listener.local_addr()?, ENVELOPE_PATH);
    axum::serve(listener, router(name, options)).await?;
    Ok(())
}
