//! REST routes next to the streaming endpoint.

use crate::error::LivescribeError;
use crate::models::ModelDescriptor;
use crate::models::catalog::is_available;
use crate::server::AppState;
use crate::server::ws;
use crate::session::Session;
use crate::worker::SupervisorStatus;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/status", get(model_status))
        .route("/api/v1/models/switch", post(switch_model))
        .route("/api/v1/sessions/:id", get(get_session))
        .route("/api/v1/sessions/:id/extend", post(extend_session))
        .route("/ws/transcribe", get(ws::transcribe))
        .with_state(state)
}

/// JSON error body with a status derived from the error kind.
struct ApiError(LivescribeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LivescribeError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            LivescribeError::SessionExpired { .. } => StatusCode::GONE,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.0.client_message(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<LivescribeError> for ApiError {
    fn from(error: LivescribeError) -> Self {
        Self(error)
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version_string(),
        "model": state.supervisor.current_model(),
        "sessions": state.sessions.len(),
    }))
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    #[serde(flatten)]
    descriptor: &'static ModelDescriptor,
    is_available: bool,
    compiled: bool,
    is_active: bool,
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dir = state.config.models.resolved_dir();
    let current = state.supervisor.current_model();
    let models: Vec<ModelEntry> = state
        .supervisor
        .catalog()
        .list()
        .iter()
        .map(|descriptor| ModelEntry {
            descriptor,
            is_available: is_available(&dir, descriptor),
            compiled: descriptor.backend.is_compiled(),
            is_active: current == Some(descriptor.id),
        })
        .collect();
    Json(json!({ "models": models, "models_dir": dir }))
}

async fn model_status(State(state): State<Arc<AppState>>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status())
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    model_id: String,
    #[serde(default)]
    keep_sessions: bool,
}

async fn switch_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let switch = state
        .switch_model(&request.model_id, request.keep_sessions)
        .await?;
    info!(model = %switch.current, changed = switch.changed, "model switch via http");
    let message = if switch.changed {
        format!("switched to {}", switch.current)
    } else {
        format!("{} already active", switch.current)
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "previous_model": switch.previous,
        "current_model": switch.current,
    })))
}

#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    session: Session,
    is_valid: bool,
    remaining_secs: i64,
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| LivescribeError::SessionNotFound { id: id.clone() })?;
    let remaining = state.sessions.get_remaining_time(&id)?;
    Ok(Json(SessionView {
        is_valid: state.sessions.is_valid(&id),
        remaining_secs: remaining.num_seconds(),
        session,
    }))
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    hours: i64,
}

async fn extend_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<Session>, ApiError> {
    state.sessions.validate(&id)?;
    Ok(Json(state.sessions.extend(&id, request.hours)?))
}
