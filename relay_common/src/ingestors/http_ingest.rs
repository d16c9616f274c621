//! # HTTP Ingestion
//!
//! Crawlers push already-encrypted envelopes here. Every endpoint is mounted
//! under `/api`:
//!
//! | method | path              | effect |
//! |--------|-------------------|--------|
//! | POST   | `/api/data`       | raw text body, one queue item |
//! | POST   | `/api/batch_data` | JSON array, one item per element |
//! | GET    | `/api/health`     | queue depth, publisher state |
//! | GET    | `/api/stats`      | queue depth and capacity |
//!
//! The relay queue enqueue blocks for up to its timeout, so it runs on the
//! blocking pool rather than on a runtime worker. A batch shares one timeout
//! across all its items, and once the queue is found full the remaining items
//! are only admitted if room is available immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::core::{Publisher, RelayQueue, RelayQueueItem};
use crate::errors::{RelayError, RelayResult};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct IngestState {
    queue: RelayQueue,
    publisher: Option<Arc<Publisher>>,
    enqueue_timeout: Duration,
    transport_address: String,
}

impl IngestState {
    /// State feeding `queue`, waiting up to `enqueue_timeout` for room.
    pub fn new(queue: RelayQueue, enqueue_timeout: Duration, transport_address: impl Into<String>) -> Self {
        Self {
            queue,
            publisher: None,
            enqueue_timeout,
            transport_address: transport_address.into(),
        }
    }

    /// Reports the publisher's state from `/api/health`.
    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    async fn enqueue(&self, payload: String) -> RelayResult<()> {
        self.enqueue_within(payload, self.enqueue_timeout).await
    }

    async fn enqueue_within(&self, payload: String, timeout: Duration) -> RelayResult<()> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.enqueue(RelayQueueItem::new(payload), timeout))
            .await
            .map_err(|e| RelayError::Transport(format!("enqueue task failed: {}", e)))?
    }
}

/// Builds the `/api` router.
pub fn router(state: IngestState) -> Router {
    let api = Router::new()
        .route("/data", post(receive_data))
        .route("/batch_data", post(receive_batch_data))
        .route("/health", get(health_check))
        .route("/stats", get(get_stats));
    Router::new().nest("/api", api).with_state(state)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: IngestState, shutdown: F) -> RelayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Ingestion API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(RelayError::from)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn receive_data(State(state): State<IngestState>, body: String) -> Response {
    match state.enqueue(body).await {
        Ok(()) => {
            tracing::info!(queue_size = state.queue.len(), "Data received and queued");
            (
                StatusCode::OK,
                Json(json!({ "status": "success", "message": "Data received" })),
            )
                .into_response()
        }
        Err(RelayError::QueueFull { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Queue full, try again later")
        }
        Err(e) => {
            tracing::error!("Receiving data failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn receive_batch_data(State(state): State<IngestState>, body: String) -> Response {
    let items = match serde_json::from_str::<Value>(&body) {
        Ok(Value::Array(items)) => items,
        _ => return error_response(StatusCode::BAD_REQUEST, "Expected JSON array"),
    };

    let started = Instant::now();
    let mut queue_full = false;
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for item in items {
        let payload = match item {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let budget = if queue_full {
            Duration::ZERO
        } else {
            state.enqueue_timeout.saturating_sub(started.elapsed())
        };
        match state.enqueue_within(payload, budget).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                if matches!(e, RelayError::QueueFull { .. }) {
                    queue_full = true;
                }
                tracing::warn!("Batch item rejected: {}", e);
                rejected += 1;
            }
        }
    }

    tracing::info!(accepted, rejected, "Batch received");
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": format!("Received {} data items", accepted),
            "accepted": accepted,
            "rejected": rejected,
        })),
    )
        .into_response()
}

async fn health_check(State(state): State<IngestState>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let publisher_state = state.publisher.as_ref().map(|p| p.state().to_string());
    Json(json!({
        "status": "healthy",
        "queue_size": state.queue.len(),
        "publisher_state": publisher_state,
        "timestamp": now.timestamp_micros() as f64 / 1_000_000.0,
    }))
}

async fn get_stats(State(state): State<IngestState>) -> impl IntoResponse {
    Json(json!({
        "queue_size": state.queue.len(),
        "max_queue_size": state.queue.capacity(),
        "transport_address": state.transport_address,
    }))
}
