//! HTTP + event-stream endpoints over the job manager.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response, sse::Sse},
    routing::get,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::JobError;
use crate::events::Frame;
use crate::jobs::{ConversationQuery, CreateJob, JobFilter, JobManager};
use crate::runner::Runner;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
}

/// Build the router with every job, event, and session route.
pub fn routes(manager: Arc<JobManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/stream", get(job_stream))
        .route("/events", get(global_stream))
        .route("/messages", get(list_messages))
        .route("/sessions", axum::routing::delete(delete_sessions))
        .with_state(AppState { manager })
}

/// CORS restricted to the configured origins.
pub fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            JobError::NotFound { .. } => StatusCode::NOT_FOUND,
            JobError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request("Invalid job ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "running_jobs": state.manager.running_count().await,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJob>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.manager.create_job(body).await?;
    Ok(Json(summary))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.list_jobs(&filter).await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.manager.get_job(id).await?))
}

// ── Streams ─────────────────────────────────────────────────────────────

/// Event-stream response; proxies must not buffer it.
fn event_stream<S>(frames: S) -> Response
where
    S: Stream<Item = Frame> + Send + 'static,
{
    let events = frames.map(|frame| Ok::<_, Infallible>(frame.into_event()));
    (
        [(HeaderName::from_static("x-accel-buffering"), "no")],
        Sse::new(events),
    )
        .into_response()
}

async fn job_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let events = state.manager.subscribe_job_events(id).await?;
    debug!(job_id = %id, "Job stream opened");
    Ok(event_stream(events.map(|event| event.to_frame())))
}

async fn global_stream(State(state): State<AppState>) -> Response {
    event_stream(state.manager.subscribe_global_events().into_frames())
}

// ── Conversations & sessions ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesParams {
    device_id: String,
    room_id: String,
    runner: String,
    thread_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<MessagesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let runner: Runner = params.runner.trim().parse().map_err(ApiError::from)?;
    let query = ConversationQuery {
        device_id: params.device_id,
        room_id: params.room_id,
        runner,
        thread_id: params.thread_id.filter(|t| !t.trim().is_empty()),
        limit: params.limit.unwrap_or(20),
        offset: params.offset.unwrap_or(0),
    };
    let jobs = state.manager.list_conversation(&query).await?;
    Ok(Json(serde_json::json!({
        "device_id": query.device_id,
        "room_id": query.room_id,
        "runner": query.runner,
        "thread_id": query.thread_id,
        "messages": jobs,
    })))
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    device_id: String,
    room_id: String,
    runner: String,
    thread_id: Option<String>,
}

async fn delete_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .manager
        .delete_sessions(
            &params.device_id,
            &params.room_id,
            &params.runner,
            params.thread_id.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({"status": "ok", "deleted": deleted})))
}
