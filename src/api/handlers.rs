//! API handlers
//!
//! ```text
//! GET    /health
//! POST   /api/register
//! POST   /api/login
//! POST   /api/logout
//! GET    /api/me
//! GET    /api/conversations
//! POST   /api/conversations/private
//! POST   /api/conversations/group
//! PATCH  /api/conversations/{id}
//! POST   /api/conversations/{id}/members
//! DELETE /api/conversations/{id}/members/{uid}
//! GET    /api/conversations/{id}/messages?limit=
//! POST   /api/conversations/{id}/read
//! PATCH  /api/conversations/{id}/settings
//! ```

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResult, AppState, AuthUser};
use crate::auth::LoginSession;
use crate::store::{clamp_history_limit, ConversationSummary, StoredMessage, User};

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub uid: i64,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub count: usize,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePrivateRequest {
    pub peer_uid: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationCreated {
    pub conversation_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub uid: i64,
}

#[derive(Debug, Serialize)]
pub struct MembershipChange {
    /// `false` when the call changed nothing
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub is_muted: Option<bool>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.relay.registry().total_connections(),
        "active_conversations": state.relay.registry().entry_count(),
    }))
}

/// POST /api/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let uid = state
        .auth
        .register(&req.username, &req.password, req.avatar.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { uid })))
}

/// POST /api/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginSession>> {
    let session = state.auth.login(&req.username, &req.password).await?;
    Ok(Json(session))
}

/// POST /api/logout
pub async fn logout(State(state): State<Arc<AppState>>, caller: AuthUser) -> ApiResult<StatusCode> {
    state.auth.logout(&caller.token).await?;
    info!(uid = caller.user.id, "User logged out");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/me
pub async fn me(caller: AuthUser) -> Json<User> {
    Json(caller.user)
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> ApiResult<Json<ConversationListResponse>> {
    let conversations = state.store.list_conversations(caller.user.id).await?;
    Ok(Json(ConversationListResponse {
        count: conversations.len(),
        conversations,
    }))
}

/// POST /api/conversations/private
pub async fn create_private(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<CreatePrivateRequest>,
) -> ApiResult<Json<ConversationCreated>> {
    let conversation_id = state
        .store
        .create_private(caller.user.id, req.peer_uid)
        .await?;
    Ok(Json(ConversationCreated { conversation_id }))
}

/// POST /api/conversations/group
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<ConversationCreated>)> {
    let conversation_id = state.store.create_group(caller.user.id, &req.title).await?;
    info!(uid = caller.user.id, conversation_id, "Group created");
    Ok((StatusCode::CREATED, Json(ConversationCreated { conversation_id })))
}

/// PATCH /api/conversations/{id}
pub async fn update_group(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(cid): Path<i64>,
    Json(req): Json<UpdateGroupRequest>,
) -> ApiResult<StatusCode> {
    state
        .store
        .update_group_info(caller.user.id, cid, req.title.as_deref(), req.avatar.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/conversations/{id}/members
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(cid): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<Json<MembershipChange>> {
    let changed = state.store.add_member(caller.user.id, cid, req.uid).await?;
    Ok(Json(MembershipChange { changed }))
}

/// DELETE /api/conversations/{id}/members/{uid}
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path((cid, uid)): Path<(i64, i64)>,
) -> ApiResult<Json<MembershipChange>> {
    let changed = state.store.remove_member(caller.user.id, cid, uid).await?;
    if changed {
        state.relay.evict(cid, uid);
    }
    Ok(Json(MembershipChange { changed }))
}

/// GET /api/conversations/{id}/messages?limit=
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(cid): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    if !state.store.is_member(cid, caller.user.id).await? {
        if !state.store.conversation_exists(cid).await? {
            return Err(ApiError::NotFound(format!("conversation {}", cid)));
        }
        return Err(ApiError::Forbidden(
            "you are not a member of this conversation".to_string(),
        ));
    }
    let messages = state
        .store
        .list_recent_messages(cid, clamp_history_limit(query.limit))
        .await?;
    Ok(Json(HistoryResponse {
        count: messages.len(),
        messages,
    }))
}

/// POST /api/conversations/{id}/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(cid): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.mark_read(caller.user.id, cid, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/conversations/{id}/settings
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(cid): Path<i64>,
    Json(req): Json<SettingsRequest>,
) -> ApiResult<StatusCode> {
    if req.is_pinned.is_none() && req.is_muted.is_none() {
        return Err(ApiError::BadRequest("nothing to update".to_string()));
    }
    state
        .store
        .set_flags(caller.user.id, cid, req.is_pinned, req.is_muted)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
