//! HTTP handlers for preview sessions.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::preview::{
    HealthBody, PreviewSession, PreviewStatus, PreviewStatusBody, SessionKey, StartPreviewRequest,
};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Get preview status.
#[tracing::instrument(skip(state))]
pub async fn get_preview(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<PreviewStatusBody>> {
    let key = SessionKey::new(project_id, session_id);
    Ok(Json(state.previews.status(&key).await?))
}

/// Start a preview. Returns once the app container exists.
#[tracing::instrument(skip(state, body))]
pub async fn start_preview(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<PreviewStatusBody>> {
    let key = SessionKey::new(project_id, session_id);
    // An empty body starts the preview with configured defaults
    let request: StartPreviewRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartPreviewRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid preview request: {}", e)))?
    };
    Ok(Json(state.previews.start_preview(&key, request).await?))
}

/// Tear down a preview and its storages.
#[tracing::instrument(skip(state))]
pub async fn delete_preview(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = SessionKey::new(project_id, session_id);
    state.previews.teardown(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Per-session health; doubles as the heartbeat target.
pub async fn preview_health(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<HealthBody>> {
    let key = SessionKey::new(project_id, session_id);
    Ok(Json(state.previews.health(&key).await?))
}

/// Session summary for the cleanup job.
#[derive(Debug, Serialize)]
pub struct PreviewSummary {
    pub project_id: String,
    pub session_id: String,
    pub status: PreviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<PreviewSession> for PreviewSummary {
    fn from(session: PreviewSession) -> Self {
        Self {
            project_id: session.project_id,
            session_id: session.session_id,
            status: session.status,
            app_url: session.app_url,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            error: session.error,
        }
    }
}

/// List tracked previews.
pub async fn list_previews(State(state): State<AppState>) -> Json<Vec<PreviewSummary>> {
    Json(
        state
            .previews
            .sessions()
            .into_iter()
            .map(PreviewSummary::from)
            .collect(),
    )
}
