//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::monitor::TriggerReason;
use crate::scheduler::{Priority, Request};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/queue/metrics", get(queue_metrics))
        .route("/queue/in-flight", get(in_flight))
        .route("/captures", post(request_capture))
        .route("/events", get(list_events))
        .route("/results", get(list_results))
}

/// Storage failures surface as 500 with the error chain as the message.
struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "api request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": format!("{:#}", self.0) } })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CaptureBody {
    trigger_reason: Option<String>,
    priority: Option<Priority>,
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn queue_metrics(State(state): State<AppState>) -> Json<Value> {
    let depths: serde_json::Map<String, Value> = state
        .dispatcher
        .queue_depths()
        .iter()
        .map(|(p, n)| (p.to_string(), json!(n)))
        .collect();
    Json(json!({
        "data": state.dispatcher.metrics(),
        "meta": {
            "depths": depths,
            "available_permits": state.dispatcher.available_permits()
        }
    }))
}

async fn in_flight(State(state): State<AppState>) -> Json<Value> {
    let list = state.dispatcher.in_flight();
    Json(json!({ "data": list, "meta": { "total": list.len() } }))
}

async fn request_capture(
    State(state): State<AppState>,
    body: Option<Json<CaptureBody>>,
) -> Response {
    // No body (no content type) means a plain manual capture.
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reason = body
        .trigger_reason
        .unwrap_or_else(|| TriggerReason::Manual.to_string());
    let priority = body
        .priority
        .unwrap_or_else(|| TriggerReason::Manual.priority());

    let request = Request::new(reason.clone(), priority);
    let request_id = request.id;
    if state.dispatcher.enqueue(request) {
        (
            StatusCode::ACCEPTED,
            Json(json!({
                "data": {
                    "request_id": request_id,
                    "trigger_reason": reason,
                    "priority": priority
                }
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "message": "capture queue is full" } })),
        )
            .into_response()
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state.store.query_events(None, None, q.limit()).await?;
    Ok(Json(json!({ "data": events, "meta": { "total": events.len() } })))
}

async fn list_results(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let results = state.store.recent_results(q.limit()).await?;
    Ok(Json(json!({ "data": results, "meta": { "total": results.len() } })))
}
