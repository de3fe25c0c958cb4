//! Payment reconciler - the single place where money turns into access.
//!
//! Every path that learns "funds arrived" funnels through [`settle`]:
//! - NOWPayments IPN webhook
//! - TON monitor polling the chain
//! - the buyer's client polling its payment
//! - an admin confirming by hand
//! - promo codes that bring the price to zero
//!
//! # Idempotency
//!
//! 1. The payment row is locked with `SELECT ... FOR UPDATE`, so concurrent
//!    settlers of the same payment serialize; the loser sees `success` and
//!    returns [`SettleOutcome::AlreadySettled`] without side effects.
//! 2. The evidence (provider transaction id) is written to a column with a
//!    unique index, so one on-chain transfer can never settle two payments.
//! 3. Status changes go through [`PaymentStatus::transition_to`]; a failed or
//!    cancelled payment cannot be resurrected.
//!
//! Telegram side effects run only after the commit, and only for the caller
//! that actually performed the transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::models::payment::{Payment, PaymentStatus};
use crate::models::subscription::{Subscription, SubscriptionStatus, renewal_window};
use crate::services::channel_access::{ChannelAccess, GrantReason};

/// Which detection path is settling the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementSource {
    Ipn,
    TonMonitor,
    ClientPoll,
    Admin,
    Free,
}

impl SettlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementSource::Ipn => "ipn",
            SettlementSource::TonMonitor => "ton_monitor",
            SettlementSource::ClientPoll => "client_poll",
            SettlementSource::Admin => "admin",
            SettlementSource::Free => "free",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub payment_id: Uuid,
    /// Provider transaction id: `ton:<hash>`, `nowpayments:<id>`, `manual:<admin>:<payment>`
    pub evidence: String,
    pub source: SettlementSource,
    /// Raw provider status to keep alongside (IPN only)
    pub provider_status: Option<String>,
}

#[derive(Debug)]
pub enum SettleOutcome {
    /// This call moved the payment to `success`.
    Settled {
        payment: Payment,
        subscription: Subscription,
    },
    /// Someone else already did; nothing was changed.
    AlreadySettled { payment: Payment },
}

impl SettleOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            SettleOutcome::Settled { payment, .. } => payment,
            SettleOutcome::AlreadySettled { payment } => payment,
        }
    }
}

/// What settling a payment in its current state should do.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Apply,
    AlreadySettled,
}

/// Decide how to treat settlement evidence for a payment in `status`.
///
/// A settled payment absorbs repeated evidence. Different evidence for an
/// already settled payment means the buyer paid twice; that is logged by the
/// caller for manual refund, never applied.
pub fn decide(status: PaymentStatus) -> Result<Decision, AppError> {
    if status == PaymentStatus::Success {
        return Ok(Decision::AlreadySettled);
    }
    status.transition_to(PaymentStatus::Success)?;
    Ok(Decision::Apply)
}

/// Whether a payment may still settle when its promo code has no uses left.
///
/// A free order is only a claim on the code and is refused. Every other
/// source means money already arrived at the discounted price.
pub fn promo_overrun(source: SettlementSource) -> Result<(), AppError> {
    match source {
        SettlementSource::Free => Err(AppError::Conflict(
            "Promo code has no uses left".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Settle a payment and activate or renew its subscription.
///
/// # Errors
///
/// - `NotFound`: no such payment
/// - `InvalidTransition`: payment is failed or cancelled
/// - `Conflict`: the evidence already settled a different payment, or a
///   free order's promo code ran out
pub async fn settle(
    pool: &DbPool,
    access: &ChannelAccess,
    request: SettleRequest,
) -> Result<SettleOutcome, AppError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(request.payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Payment"))?;

    if decide(payment.status)? == Decision::AlreadySettled {
        tx.rollback().await?;
        if payment.provider_tx_id.as_deref() != Some(request.evidence.as_str()) {
            tracing::warn!(
                payment_id = %payment.id,
                memo = %payment.memo,
                settled_with = ?payment.provider_tx_id,
                new_evidence = %request.evidence,
                source = request.source.as_str(),
                "second payment received for an already settled order"
            );
        }
        return Ok(SettleOutcome::AlreadySettled { payment });
    }

    let updated = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET status = $2,
            provider_tx_id = $3,
            provider_status = COALESCE($4, provider_status),
            settled_by = $5,
            paid_at = $6,
            updated_at = $6
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment.id)
    .bind(PaymentStatus::Success.as_str())
    .bind(&request.evidence)
    .bind(&request.provider_status)
    .bind(request.source.as_str())
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let updated = match updated {
        Ok(p) => p,
        Err(e) if db::is_unique_violation(&e) => {
            tx.rollback().await?;
            tracing::warn!(
                payment_id = %payment.id,
                evidence = %request.evidence,
                "evidence already used by another payment"
            );
            return Err(AppError::Conflict(
                "Transaction already settled another payment".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(promo_code_id) = updated.promo_code_id {
        let redeemed = sqlx::query(
            r#"
            UPDATE promo_codes SET used_count = used_count + 1
            WHERE id = $1 AND (max_uses IS NULL OR used_count < max_uses)
            "#,
        )
        .bind(promo_code_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if redeemed == 0 {
            if let Err(e) = promo_overrun(request.source) {
                tx.rollback().await?;
                tracing::warn!(payment_id = %payment.id, promo_code_id = %promo_code_id, "promo code ran out before settlement");
                return Err(e);
            }
            // Funds already arrived under the quoted price; honour the order.
            tracing::warn!(
                payment_id = %payment.id,
                promo_code_id = %promo_code_id,
                source = request.source.as_str(),
                "promo code redeemed past its usage limit"
            );
            sqlx::query("UPDATE promo_codes SET used_count = used_count + 1 WHERE id = $1")
                .bind(promo_code_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    let duration_days: i32 = sqlx::query_scalar("SELECT duration_days FROM products WHERE id = $1")
        .bind(updated.product_id)
        .fetch_one(&mut *tx)
        .await?;

    let existing = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE user_id = $1 AND product_id = $2 FOR UPDATE",
    )
    .bind(updated.user_id)
    .bind(updated.product_id)
    .fetch_optional(&mut *tx)
    .await?;

    let was_active = existing
        .as_ref()
        .is_some_and(|s| s.status == SubscriptionStatus::Active);
    if let Some(sub) = &existing {
        sub.status.transition_to(SubscriptionStatus::Active)?;
    }
    let (starts_at, ends_at) = renewal_window(existing.as_ref(), duration_days, now);

    let subscription =
        upsert_active_subscription(&mut tx, &updated, starts_at, ends_at).await?;

    // A paid subscription supersedes any running demo of the same product.
    sqlx::query(
        "UPDATE demo_accesses SET status = 'expired' WHERE user_id = $1 AND product_id = $2 AND status = 'active'",
    )
    .bind(updated.user_id)
    .bind(updated.product_id)
    .execute(&mut *tx)
    .await?;

    let telegram_id: i64 = sqlx::query_scalar("SELECT telegram_id FROM users WHERE id = $1")
        .bind(updated.user_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(
        payment_id = %updated.id,
        memo = %updated.memo,
        source = request.source.as_str(),
        evidence = %request.evidence,
        ends_at = %subscription.ends_at,
        "payment settled"
    );

    let reason = if was_active {
        GrantReason::Renewal
    } else {
        GrantReason::Purchase
    };
    if let Err(e) = access
        .grant(pool, telegram_id, updated.product_id, subscription.ends_at, reason)
        .await
    {
        tracing::error!(payment_id = %updated.id, error = %e, "failed to grant channel access");
    }

    Ok(SettleOutcome::Settled {
        payment: updated,
        subscription,
    })
}

async fn upsert_active_subscription(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payment: &Payment,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<Subscription, AppError> {
    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (user_id, product_id, status, starts_at, ends_at, last_payment_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (user_id, product_id) DO UPDATE
        SET status = EXCLUDED.status,
            starts_at = EXCLUDED.starts_at,
            ends_at = EXCLUDED.ends_at,
            last_payment_id = EXCLUDED.last_payment_id,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(payment.user_id)
    .bind(payment.product_id)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(starts_at)
    .bind(ends_at)
    .bind(payment.id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(subscription)
}

/// Move a payment to `failed`, `expired` or `cancelled`.
///
/// Repeating the same transition is a no-op, so duplicate IPNs are harmless.
pub async fn close_payment(
    pool: &DbPool,
    payment_id: Uuid,
    target: PaymentStatus,
    provider_status: Option<&str>,
) -> Result<Payment, AppError> {
    let mut tx = pool.begin().await?;

    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Payment"))?;

    if payment.status == target {
        tx.rollback().await?;
        return Ok(payment);
    }
    payment.status.transition_to(target)?;

    let updated = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET status = $2,
            provider_status = COALESCE($3, provider_status),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment_id)
    .bind(target.as_str())
    .bind(provider_status)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(payment_id = %payment_id, status = target.as_str(), "payment closed");
    Ok(updated)
}

/// Keep the latest provider status of an in-flight payment.
pub async fn record_provider_status(
    pool: &DbPool,
    payment_id: Uuid,
    provider_status: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE payments SET provider_status = $2, updated_at = NOW() WHERE id = $1")
        .bind(payment_id)
        .bind(provider_status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Expire pending payments whose deadline passed. Returns how many changed.
pub async fn expire_stale(pool: &DbPool, now: DateTime<Utc>) -> Result<u64, AppError> {
    let result = sqlx::query(
        "UPDATE payments SET status = $1, updated_at = NOW() WHERE status = $2 AND expires_at < $3",
    )
    .bind(PaymentStatus::Expired.as_str())
    .bind(PaymentStatus::Pending.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn find_by_memo(pool: &DbPool, memo: &str) -> Result<Option<Payment>, AppError> {
    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE memo = $1")
        .bind(memo.trim())
        .fetch_optional(pool)
        .await?;
    Ok(payment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_expired_payments_settle() {
        assert_eq!(decide(PaymentStatus::Pending).unwrap(), Decision::Apply);
        assert_eq!(decide(PaymentStatus::Expired).unwrap(), Decision::Apply);
    }

    #[test]
    fn settled_payment_absorbs_repeated_evidence() {
        assert_eq!(
            decide(PaymentStatus::Success).unwrap(),
            Decision::AlreadySettled
        );
    }

    #[test]
    fn failed_or_cancelled_payment_is_not_resurrected() {
        assert!(matches!(
            decide(PaymentStatus::Failed),
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            decide(PaymentStatus::Cancelled),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn exhausted_promo_refuses_only_free_orders() {
        assert!(matches!(
            promo_overrun(SettlementSource::Free),
            Err(AppError::Conflict(_))
        ));
        for source in [
            SettlementSource::Ipn,
            SettlementSource::TonMonitor,
            SettlementSource::ClientPoll,
            SettlementSource::Admin,
        ] {
            assert!(promo_overrun(source).is_ok());
        }
    }

    #[test]
    fn source_names_match_settled_by_column() {
        assert_eq!(SettlementSource::TonMonitor.as_str(), "ton_monitor");
        assert_eq!(SettlementSource::ClientPoll.as_str(), "client_poll");
    }
}
