//! Admin endpoints for broadcasts and the admin roster.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::admin::{AddAdminRequest, Admin};
use crate::models::broadcast::{Broadcast, BroadcastMessage, CreateBroadcastRequest};
use crate::services::{broadcast_service, user_service};
use crate::state::AppState;

/// Create a draft broadcast.
///
/// # Request Body
///
/// ```json
/// {
///   "text": "<b>New signals channel</b> is live!",
///   "filter": { "kind": "active_subscribers" }
/// }
/// ```
///
/// `filter.kind` is one of `all`, `active_subscribers`,
/// `expired_subscribers`, or `product` with a `product_id`.
pub async fn create_broadcast(
    State(pool): State<DbPool>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<CreateBroadcastRequest>,
) -> Result<impl IntoResponse, AppError> {
    let broadcast = broadcast_service::create(&pool, auth.user.telegram_id, request).await?;
    Ok((StatusCode::CREATED, Json(broadcast)))
}

pub async fn list_broadcasts(State(pool): State<DbPool>) -> Result<Json<Vec<Broadcast>>, AppError> {
    Ok(Json(broadcast_service::list(&pool).await?))
}

#[derive(Debug, Serialize)]
pub struct BroadcastDetail {
    #[serde(flatten)]
    pub broadcast: Broadcast,
    pub messages: Vec<BroadcastMessage>,
}

pub async fn get_broadcast(
    State(pool): State<DbPool>,
    Path(broadcast_id): Path<Uuid>,
) -> Result<Json<BroadcastDetail>, AppError> {
    let broadcast = broadcast_service::get(&pool, broadcast_id).await?;
    let messages = broadcast_service::list_messages(&pool, broadcast_id).await?;
    Ok(Json(BroadcastDetail { broadcast, messages }))
}

/// Start delivery. Returns 202 right away; progress shows up in
/// `GET /api/admin/broadcasts/{id}`.
pub async fn send_broadcast(
    State(state): State<AppState>,
    Path(broadcast_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let broadcast = broadcast_service::start(&state, broadcast_id).await?;
    Ok((StatusCode::ACCEPTED, Json(broadcast)))
}

pub async fn list_admins(State(pool): State<DbPool>) -> Result<Json<Vec<Admin>>, AppError> {
    Ok(Json(user_service::list_admins(&pool).await?))
}

pub async fn add_admin(
    State(pool): State<DbPool>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<AddAdminRequest>,
) -> Result<impl IntoResponse, AppError> {
    let admin = user_service::add_admin(&pool, request.telegram_id, auth.user.telegram_id).await?;
    Ok((StatusCode::CREATED, Json(admin)))
}

pub async fn remove_admin(
    State(state): State<AppState>,
    Path(telegram_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    user_service::remove_admin(&state.pool, &state.config, telegram_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
