//! Mock backend for integration tests: an axum server on a free loopback port
//! serving liveness, request/response and SSE streaming endpoints.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tether::bus::EventBus;
use tether::connection::{BackendSupervisor, ClientError, ConnectionRegistry, EndpointDescriptor};

/// Delay between chunks of the `slow` chat stream.
pub const SLOW_CHUNK_GAP: Duration = Duration::from_millis(200);

pub struct NoRestart;

#[async_trait]
impl BackendSupervisor for NoRestart {
    async fn restart_backend(&self) -> Result<EndpointDescriptor, ClientError> {
        Err(ClientError::Supervisor("test backend cannot restart".to_string()))
    }
}

/// Start the mock backend and return its base address, e.g. `http://127.0.0.1:40123`.
pub async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "healthy", "version": "test" })) }))
        .route("/degraded", get(|| async { Json(json!({ "status": "degraded" })) }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({ "status": "healthy" }))
            }),
        )
        .route(
            "/echo",
            post(|Json(body): Json<Value>| async move { Json(json!({ "echo": body })) }),
        )
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/tasks/:task_id/stream", get(task_stream));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Registry already connected to a fresh mock backend.
pub async fn connected_registry() -> Arc<ConnectionRegistry> {
    let address = spawn_backend().await;
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(EventBus::new()),
        Arc::new(NoRestart),
    ));
    registry.handle_ready(EndpointDescriptor::new(address, 4242));
    registry
}

fn sse(chunks: Vec<String>, gap: Option<Duration>) -> Response {
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        if let Some(gap) = gap {
            tokio::time::sleep(gap).await;
        }
        Ok::<_, Infallible>(chunk)
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn event(name: &str, payload: Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, payload)
}

async fn chat_stream(Json(body): Json<Value>) -> Response {
    let message = body.get("message").and_then(Value::as_str).unwrap_or_default();
    match message {
        "hello" => sse(
            vec![
                event("metadata", json!({ "user_message": { "id": "u1", "content": "hello" } })),
                // Split inside the JSON of the first content event.
                "event: content\ndata: {\"con".to_string(),
                format!("tent\":\"Hel\"}}\n\n{}", event("content", json!({ "content": "lo" }))),
                ": keep-alive\n\n".to_string(),
                event("done", json!({ "message_id": "m1", "confidence": 0.75 })),
                "data: [DONE]\n\n".to_string(),
            ],
            None,
        ),
        "fail" => sse(
            vec![
                event("content", json!({ "content": "par" })),
                event("error", json!({ "error": "model offline" })),
            ],
            None,
        ),
        "cut" => sse(vec![event("content", json!({ "content": "par" }))], None),
        "slow" => sse(
            (0..20).map(|_| event("content", json!({ "content": "A" }))).collect(),
            Some(SLOW_CHUNK_GAP),
        ),
        "missing" => (StatusCode::NOT_FOUND, "no such chat").into_response(),
        other => sse(
            vec![
                event("content", json!({ "content": other })),
                event("done", json!({ "message_id": "echo" })),
            ],
            None,
        ),
    }
}

async fn task_stream(Path(task_id): Path<String>) -> Response {
    if task_id == "broken" {
        return sse(vec![event("error", json!("index corrupted"))], None);
    }
    sse(
        vec![
            event("metadata", json!({ "task_id": task_id, "kind": "index" })),
            event("progress", json!({ "processed": 1, "total": 2, "current_file": "a.md" })),
            event("log", json!({ "message": "indexed a.md" })),
            event("progress", json!({ "progress": 100, "message": "finalizing" })),
            event("done", json!({ "indexed": 2 })),
        ],
        None,
    )
}
