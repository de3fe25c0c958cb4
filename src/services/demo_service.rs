//! Free trial access to a product's channels.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::demo::DemoAccess;
use crate::models::product::Product;
use crate::models::user::User;
use crate::services::channel_access::GrantReason;
use crate::services::payment_service;
use crate::state::AppState;

/// Length of the demo in days, if this user may start one.
pub fn demo_days(product: &Product, has_active_subscription: bool) -> Result<i32, AppError> {
    let days = product
        .demo_days
        .filter(|d| *d > 0)
        .ok_or_else(|| AppError::InvalidRequest(format!("{} has no demo", product.name)))?;
    if has_active_subscription {
        return Err(AppError::Conflict(
            "You already have an active subscription".to_string(),
        ));
    }
    Ok(days)
}

/// Start the one demo a user gets per product and invite them to its channels.
///
/// # Errors
///
/// - `NotFound`: product missing or inactive
/// - `InvalidRequest`: product offers no demo
/// - `Conflict`: demo already claimed, or the user is already subscribed
pub async fn claim_demo(
    state: &AppState,
    user: &User,
    product_id: Uuid,
) -> Result<DemoAccess, AppError> {
    let product = payment_service::find_active_product(&state.pool, product_id).await?;

    let has_active_subscription: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM subscriptions WHERE user_id = $1 AND product_id = $2 AND status = 'active')",
    )
    .bind(user.id)
    .bind(product_id)
    .fetch_one(&state.pool)
    .await?;

    let days = demo_days(&product, has_active_subscription)?;
    let expires_at = Utc::now() + Duration::days(i64::from(days));

    // The unique (user_id, product_id) pair makes a second claim a no-op.
    let demo = sqlx::query_as::<_, DemoAccess>(
        r#"
        INSERT INTO demo_accesses (user_id, product_id, status, expires_at)
        VALUES ($1, $2, 'active', $3)
        ON CONFLICT (user_id, product_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(product_id)
    .bind(expires_at)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::Conflict("Demo already claimed".to_string()))?;

    tracing::info!(
        telegram_id = user.telegram_id,
        %product_id,
        expires_at = %demo.expires_at,
        "demo claimed"
    );

    if let Err(e) = state
        .access
        .grant(&state.pool, user.telegram_id, product_id, demo.expires_at, GrantReason::Demo)
        .await
    {
        tracing::error!(telegram_id = user.telegram_id, error = %e, "failed to grant demo access");
    }

    Ok(demo)
}

pub async fn list_user_demos(state: &AppState, user_id: Uuid) -> Result<Vec<DemoAccess>, AppError> {
    let demos = sqlx::query_as::<_, DemoAccess>(
        "SELECT * FROM demo_accesses WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(demos)
}
