//! Admin view of subscriptions and manual revocation.

use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::subscription::{
    Subscription, SubscriptionListQuery, SubscriptionStatus, SubscriptionView,
};
use crate::services::channel_access::{ChannelAccess, RevokeReason};

pub async fn list_subscriptions(
    pool: &DbPool,
    query: &SubscriptionListQuery,
) -> Result<Vec<SubscriptionView>, AppError> {
    let subscriptions = sqlx::query_as::<_, SubscriptionView>(
        r#"
        SELECT s.id, s.user_id, u.telegram_id, s.product_id, p.name AS product_name,
               s.status, s.starts_at, s.ends_at
        FROM subscriptions s
        JOIN users u ON u.id = s.user_id
        JOIN products p ON p.id = s.product_id
        WHERE ($1::TEXT IS NULL OR s.status = $1)
          AND ($2::UUID IS NULL OR s.product_id = $2)
        ORDER BY s.ends_at DESC
        LIMIT 500
        "#,
    )
    .bind(query.status.map(|s| s.as_str()))
    .bind(query.product_id)
    .fetch_all(pool)
    .await?;
    Ok(subscriptions)
}

/// Revoke an active subscription and remove the user from its channels.
///
/// # Errors
///
/// - `NotFound`: no such subscription
/// - `InvalidTransition`: it is not active
pub async fn revoke(
    pool: &DbPool,
    access: &ChannelAccess,
    subscription_id: Uuid,
) -> Result<Subscription, AppError> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE",
    )
    .bind(subscription_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Subscription"))?;

    current.status.transition_to(SubscriptionStatus::Revoked)?;

    let revoked = sqlx::query_as::<_, Subscription>(
        "UPDATE subscriptions SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(subscription_id)
    .bind(SubscriptionStatus::Revoked.as_str())
    .fetch_one(&mut *tx)
    .await?;

    let telegram_id: i64 = sqlx::query_scalar("SELECT telegram_id FROM users WHERE id = $1")
        .bind(revoked.user_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(%subscription_id, telegram_id, "subscription revoked");

    if let Err(e) = access
        .revoke(pool, telegram_id, revoked.product_id, RevokeReason::Revoked)
        .await
    {
        tracing::error!(%subscription_id, error = %e, "failed to remove revoked user from channels");
    }

    Ok(revoked)
}
