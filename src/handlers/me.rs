//! The caller's own profile, subscriptions and demos.

use axum::{Extension, Json, extract::State};

use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::demo::DemoAccess;
use crate::models::subscription::SubscriptionView;
use crate::models::user::MeResponse;
use crate::services::{demo_service, user_service};
use crate::state::AppState;

/// `GET /api/me`
pub async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<MeResponse>, AppError> {
    let is_admin = user_service::is_admin(&state.pool, &state.config, auth.user.telegram_id).await?;
    Ok(Json(MeResponse {
        user: auth.user,
        is_admin,
    }))
}

/// `GET /api/subscriptions`, newest end date first.
pub async fn my_subscriptions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<SubscriptionView>>, AppError> {
    let subscriptions = sqlx::query_as::<_, SubscriptionView>(
        r#"
        SELECT s.id, s.user_id, u.telegram_id, s.product_id, p.name AS product_name,
               s.status, s.starts_at, s.ends_at
        FROM subscriptions s
        JOIN users u ON u.id = s.user_id
        JOIN products p ON p.id = s.product_id
        WHERE s.user_id = $1
        ORDER BY s.ends_at DESC
        "#,
    )
    .bind(auth.user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(subscriptions))
}

/// `GET /api/demos`
pub async fn my_demos(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<DemoAccess>>, AppError> {
    Ok(Json(demo_service::list_user_demos(&state, auth.user.id).await?))
}
