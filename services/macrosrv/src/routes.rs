//! API routes and handlers
//!
//! Ingress and inspection endpoints: event publishing (always 202, the
//! router decides what runs), per-macro execution history, and resume for
//! executions suspended on a prompt.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use macro_engine::{
    AutomationEngine, EventEnvelope, EventKind, EventOrigin, EventPublisher, ExecutionStatus,
    ExecutionStore, HistoryFilter, Scope,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{MacrosrvError, Result};

/// Application state shared across all handlers
pub struct AppState {
    pub publisher: EventPublisher,
    pub engine: Arc<AutomationEngine>,
    pub store: Arc<dyn ExecutionStore>,
    /// Bearer token required on /api routes, None disables the check
    pub token: Option<String>,
}

/// Create all API routes with state
pub fn create_routes(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/v1/events", post(publish_event))
        .route("/api/v1/macros/{id}/history", get(macro_history))
        .route("/api/v1/executions/{id}/resume", post(resume_execution))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
        .with_state(state)
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = &state.token else {
        return next.run(request).await;
    };
    let expected = format!("Bearer {token}");
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "macrosrv" }))
}

/// Inbound event over HTTP, normalized into an envelope
#[derive(Debug, Deserialize)]
pub struct IngressEvent {
    pub kind: EventKind,

    /// Acting user, when the event is user-originated
    #[serde(default)]
    pub user: Option<String>,

    /// Webhook source tag, e.g. "gitlab"
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub payload: Scope,
}

impl IngressEvent {
    fn into_envelope(self) -> EventEnvelope {
        let origin = match (self.user, self.source) {
            (Some(name), _) => EventOrigin::User { name },
            (None, Some(source)) => EventOrigin::Webhook { source },
            (None, None) => EventOrigin::System,
        };
        EventEnvelope::new(self.kind, origin, self.payload)
    }
}

/// Accept an event. Matching and execution happen asynchronously; the
/// caller gets the envelope id for correlation.
async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(ingress): Json<IngressEvent>,
) -> (StatusCode, Json<Value>) {
    let event = ingress.into_envelope();
    let event_id = event.id;
    tracing::debug!(event_id = %event_id, kind = ?event.kind, "event accepted");
    state.publisher.publish(event);
    (StatusCode::ACCEPTED, Json(json!({ "event_id": event_id })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<String>,
}

async fn macro_history(
    State(state): State<Arc<AppState>>,
    Path(macro_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    let status = query
        .status
        .map(|s| {
            serde_json::from_value::<ExecutionStatus>(json!(s.to_uppercase()))
                .map_err(|_| MacrosrvError::BadRequest(format!("unknown status '{s}'")))
        })
        .transpose()?;

    let filter = HistoryFilter { status, since: None, limit: query.limit.unwrap_or(50) };
    let executions = state.store.history(macro_id, &filter).await?;
    Ok(Json(json!({ "macro_id": macro_id, "executions": executions })))
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub value: Value,
}

async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<Value>> {
    state.engine.resume(execution_id, request.value)?;
    Ok(Json(json!({ "execution_id": execution_id, "resumed": true })))
}
