//! Periodic sweep of everything that runs out on a clock.
//!
//! Each pass expires overdue pending payments, ends subscriptions and demos
//! past their end date, and removes those users from the product channels.
//! Each subscription or demo is ended in its own transaction that keeps the
//! row locked across the Telegram calls. A Telegram failure is logged and
//! never undoes the status change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::interval;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::product::Channel;
use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::services::channel_access::{self, ChannelAccess, RevokeReason};
use crate::services::reconciler;
use crate::state::AppState;

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub payments_expired: u64,
    pub subscriptions_expired: usize,
    pub demos_expired: usize,
}

impl SweepSummary {
    fn is_empty(&self) -> bool {
        *self == SweepSummary::default()
    }
}

/// One sweep as of `now`.
pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> Result<SweepSummary, AppError> {
    let payments_expired = reconciler::expire_stale(&state.pool, now).await?;

    let due: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM subscriptions WHERE status = 'active' AND ends_at <= $1",
    )
    .bind(now)
    .fetch_all(&state.pool)
    .await?;

    let mut subscriptions_expired = 0;
    for subscription_id in due {
        match end_subscription(state, subscription_id, now).await {
            Ok(true) => subscriptions_expired += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(%subscription_id, error = %e, "failed to end subscription"),
        }
    }

    let due_demos: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM demo_accesses WHERE status = 'active' AND expires_at <= $1",
    )
    .bind(now)
    .fetch_all(&state.pool)
    .await?;

    let mut demos_expired = 0;
    for demo_id in due_demos {
        match end_demo(state, demo_id, now).await {
            Ok(true) => demos_expired += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(%demo_id, error = %e, "failed to end demo"),
        }
    }

    Ok(SweepSummary {
        payments_expired,
        subscriptions_expired,
        demos_expired,
    })
}

/// End one subscription and remove the user from its channels.
///
/// The row stays locked until the users are kicked, so a renewal settling at
/// the same moment waits and re-invites afterwards. A row that a settlement
/// holds right now is skipped and picked up by the next sweep.
async fn end_subscription(
    state: &AppState,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let mut tx = state.pool.begin().await?;

    let subscription = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(subscription_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(subscription) = subscription else {
        tx.rollback().await?;
        return Ok(false);
    };
    if !subscription.is_due(now) {
        tx.rollback().await?;
        return Ok(false);
    }

    subscription.status.transition_to(SubscriptionStatus::Expired)?;
    sqlx::query("UPDATE subscriptions SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(subscription.id)
        .bind(SubscriptionStatus::Expired.as_str())
        .execute(&mut *tx)
        .await?;

    let telegram_id: i64 = sqlx::query_scalar("SELECT telegram_id FROM users WHERE id = $1")
        .bind(subscription.user_id)
        .fetch_one(&mut *tx)
        .await?;
    let (product_name, channels) =
        channel_access::load_product_channels(&state.pool, subscription.product_id).await?;

    kick_if_due(&state.access, &subscription, telegram_id, &product_name, &channels, now).await;
    tx.commit().await?;
    Ok(true)
}

/// Remove the user from `channels` unless the subscription is no longer due.
async fn kick_if_due(
    access: &ChannelAccess,
    subscription: &Subscription,
    telegram_id: i64,
    product_name: &str,
    channels: &[Channel],
    now: DateTime<Utc>,
) -> bool {
    if !subscription.is_due(now) {
        return false;
    }
    let report = access
        .revoke_channels(telegram_id, product_name, channels, RevokeReason::Expired)
        .await;
    if !report.failed_chats.is_empty() {
        tracing::warn!(telegram_id, product_id = %subscription.product_id, failed_chats = ?report.failed_chats, "partial channel removal");
    }
    true
}

/// End one demo. A user who bought the product in the meantime keeps
/// their channels. Settlement expires the demo row itself, so holding the
/// lock here orders the kick before any grant.
async fn end_demo(state: &AppState, demo_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
    let mut tx = state.pool.begin().await?;

    let demo = sqlx::query_as::<_, (Uuid, Uuid)>(
        r#"
        SELECT user_id, product_id FROM demo_accesses
        WHERE id = $1 AND status = 'active' AND expires_at <= $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(demo_id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((user_id, product_id)) = demo else {
        tx.rollback().await?;
        return Ok(false);
    };

    sqlx::query("UPDATE demo_accesses SET status = 'expired' WHERE id = $1")
        .bind(demo_id)
        .execute(&mut *tx)
        .await?;

    let subscribed: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM subscriptions
            WHERE user_id = $1 AND product_id = $2 AND status = 'active'
        )
        "#,
    )
    .bind(user_id)
    .bind(product_id)
    .fetch_one(&mut *tx)
    .await?;

    if !subscribed {
        let telegram_id: i64 = sqlx::query_scalar("SELECT telegram_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        let (product_name, channels) =
            channel_access::load_product_channels(&state.pool, product_id).await?;
        let report = state
            .access
            .revoke_channels(telegram_id, &product_name, &channels, RevokeReason::DemoEnded)
            .await;
        if !report.failed_chats.is_empty() {
            tracing::warn!(telegram_id, %product_id, failed_chats = ?report.failed_chats, "partial channel removal");
        }
    }

    tx.commit().await?;
    Ok(true)
}

/// Sweep on an interval until `shutdown` fires.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<()>) {
    let period = StdDuration::from_secs(state.config.expiry_sweep_interval_secs.max(10));
    let mut ticker = interval(period);
    tracing::info!(interval_secs = period.as_secs(), "expiry sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_once(&state, Utc::now()).await {
                    Ok(summary) if !summary.is_empty() => tracing::info!(?summary, "expiry sweep"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("expiry sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::subscription::tests::subscription;
    use crate::services::channel_access::tests::channel;
    use crate::services::telegram::tests::{Call, FakeTelegram};
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn renewed_subscription_is_not_kicked() {
        let fake = Arc::new(FakeTelegram::default());
        let access = ChannelAccess::new(fake.clone(), 24);
        let now = Utc::now();
        let renewed = subscription(SubscriptionStatus::Active, now + Duration::days(30));

        let kicked = kick_if_due(&access, &renewed, 77, "VIP", &[channel(-1001, "Signals")], now).await;

        assert!(!kicked);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn overdue_subscription_is_kicked_and_told() {
        let fake = Arc::new(FakeTelegram::default());
        let access = ChannelAccess::new(fake.clone(), 24);
        let now = Utc::now();
        let overdue = subscription(SubscriptionStatus::Active, now - Duration::minutes(1));

        let kicked = kick_if_due(&access, &overdue, 77, "VIP", &[channel(-1001, "Signals")], now).await;

        assert!(kicked);
        let calls = fake.calls();
        assert!(calls.contains(&Call::Ban { chat_id: -1001, user_id: 77 }));
        assert!(calls.iter().any(|c| matches!(c, Call::Message { chat_id: 77, text } if text.contains("expired"))));
    }

    #[test]
    fn only_active_subscriptions_past_their_end_are_due() {
        let now = Utc::now();
        assert!(subscription(SubscriptionStatus::Active, now).is_due(now));
        assert!(!subscription(SubscriptionStatus::Active, now + Duration::seconds(1)).is_due(now));
        assert!(!subscription(SubscriptionStatus::Revoked, now - Duration::days(1)).is_due(now));
    }

    #[test]
    fn empty_summary_is_not_logged() {
        assert!(SweepSummary::default().is_empty());
        let summary = SweepSummary {
            demos_expired: 1,
            ..Default::default()
        };
        assert!(!summary.is_empty());
    }
}
