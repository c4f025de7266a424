//! HTTP route definitions

use std::path::Path;
use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::AppState;

/// Build the API router
///
/// Unknown paths fall back to files under `static_dir` when one is given.
pub fn create_router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/private", post(create_private))
        .route("/api/conversations/group", post(create_group))
        .route("/api/conversations/{id}", patch(update_group))
        .route("/api/conversations/{id}/members", post(add_member))
        .route("/api/conversations/{id}/members/{uid}", delete(remove_member))
        .route("/api/conversations/{id}/messages", get(list_messages))
        .route("/api/conversations/{id}/read", post(mark_read))
        .route("/api/conversations/{id}/settings", patch(update_settings));

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
