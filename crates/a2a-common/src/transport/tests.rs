//! Tests for the channel and HTTP transports

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::protocol::{BrokerError, Envelope, Recipient, WireEnvelope, WireResponse};
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;

    fn envelope(to: &str) -> Envelope {
        Envelope::new("coordinator", Recipient::Worker(to.into()), json!({"n": 1}))
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_channel_transport_round_trip() {
        let (transport, _task) = ChannelTransport::spawn("echo", 4, |env: Envelope| async move {
            Ok(json!({"echo": env.payload, "id": env.id}))
        });
        let env = envelope("echo");
        let id = env.id;

        let reply = transport.send(env).await.unwrap();
        assert_eq!(reply, json!({"echo": {"n": 1}, "id": id}));
        assert_eq!(transport.endpoint(), "channel://echo");
    }

    #[tokio::test]
    async fn test_channel_transport_inbox_closed() {
        let (transport, inbox) = ChannelTransport::pair("gone", 1);
        drop(inbox);

        let err = transport.send(envelope("gone")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_channel_transport_dropped_delivery() {
        let (transport, mut inbox) = ChannelTransport::pair("flaky", 1);
        tokio::spawn(async move {
            // Receive and drop without answering
            let _ = inbox.recv().await;
        });

        let err = transport.send(envelope("flaky")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_channel_transport_manual_inbox() {
        let (transport, mut inbox) = ChannelTransport::pair("manual", 1);
        assert_eq!(inbox.name(), "manual");
        tokio::spawn(async move {
            let delivery = inbox.recv().await.unwrap();
            let payload = delivery.envelope.payload.clone();
            assert!(delivery.respond(Err(BrokerError::WorkerError(payload.to_string()))));
        });

        let err = transport.send(envelope("manual")).await.unwrap_err();
        assert!(matches!(err, BrokerError::WorkerError(msg) if msg.contains("\"n\"")));
    }

    #[test]
    fn test_http_transport_rejects_non_http_url() {
        assert!(matches!(
            HttpTransport::new("127.0.0.1:9001"),
            Err(BrokerError::Validation(_))
        ));
        assert!(HttpTransport::new("https://example.com").is_err());
        assert!(HttpTransport::new("http://127.0.0.1:9001").is_ok());
    }

    #[tokio::test]
    async fn test_http_transport_success() {
        let app = Router::new().route(
            "/",
            post(|Json(env): Json<WireEnvelope>| async move {
                Json(WireResponse::success(json!({"got": env.payload, "attempt": env.attempt})))
            }),
        );
        let addr = serve(app).await;

        let transport = HttpTransport::new(format!("http://{}/", addr)).unwrap();
        let reply = transport.send(envelope("remote")).await.unwrap();
        assert_eq!(reply, json!({"got": {"n": 1}, "attempt": 0}));
    }

    #[tokio::test]
    async fn test_http_transport_success_with_null_payload() {
        let app = Router::new()
            .route("/null", post(|| async { Json(WireResponse::success(serde_json::Value::Null)) }))
            .route("/bare", post(|| async { Json(json!({"success": true})) }));
        let addr = serve(app).await;

        for path in ["null", "bare"] {
            let transport = HttpTransport::new(format!("http://{}/{}", addr, path)).unwrap();
            let reply = transport.send(envelope("remote")).await.unwrap();
            assert!(reply.is_null(), "{} reply should decode to null", path);
        }
    }

    #[tokio::test]
    async fn test_http_transport_worker_error_is_not_retryable() {
        let app = Router::new().route(
            "/",
            post(|| async { Json(WireResponse::error("cannot plan meals today")) }),
        );
        let addr = serve(app).await;

        let transport = HttpTransport::new(format!("http://{}/", addr)).unwrap();
        let err = transport.send(envelope("remote")).await.unwrap_err();
        assert!(matches!(err, BrokerError::WorkerError(ref m) if m == "cannot plan meals today"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_transport_server_error_is_retryable() {
        let app = Router::new().route(
            "/",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let addr = serve(app).await;

        let transport = HttpTransport::new(format!("http://{}/", addr)).unwrap();
        let err = transport.send(envelope("remote")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_transport_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(format!("http://{}/", addr)).unwrap();
        let err = transport.send(envelope("remote")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
    }
}
