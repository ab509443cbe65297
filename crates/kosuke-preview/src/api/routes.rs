//! API route definitions.

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

const PREVIEW_PATH: &str = "/api/projects/{project_id}/chat-sessions/{session_id}/preview";
const PREVIEW_HEALTH_PATH: &str =
    "/api/projects/{project_id}/chat-sessions/{session_id}/preview/health";

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/previews", get(handlers::list_previews))
        .route(
            PREVIEW_PATH,
            get(handlers::get_preview)
                .post(handlers::start_preview)
                .delete(handlers::delete_preview),
        )
        .route(PREVIEW_HEALTH_PATH, get(handlers::preview_health))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
