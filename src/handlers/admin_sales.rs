//! Admin endpoints for payments, subscriptions and the dashboard.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Serialize;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::payment::{ConfirmPaymentRequest, Payment, PaymentListQuery};
use crate::models::subscription::{Subscription, SubscriptionListQuery, SubscriptionView};
use crate::services::reconciler::SettleOutcome;
use crate::services::{payment_service, subscription_service};
use crate::state::AppState;

/// `GET /api/admin/payments?status=pending&user_id=...&limit=100`
pub async fn list_payments(
    State(pool): State<DbPool>,
    Query(query): Query<PaymentListQuery>,
) -> Result<Json<Vec<Payment>>, AppError> {
    Ok(Json(payment_service::list_payments(&pool, &query).await?))
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    /// `settled`, or `already_settled` when another path got there first
    pub outcome: &'static str,
    pub payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
}

impl From<SettleOutcome> for ConfirmResponse {
    fn from(outcome: SettleOutcome) -> Self {
        match outcome {
            SettleOutcome::Settled {
                payment,
                subscription,
            } => Self {
                outcome: "settled",
                payment,
                subscription: Some(subscription),
            },
            SettleOutcome::AlreadySettled { payment } => Self {
                outcome: "already_settled",
                payment,
                subscription: None,
            },
        }
    }
}

/// Confirm a payment by hand.
///
/// Goes through the same reconciler as the IPN and the TON monitor, so
/// confirming an already settled payment changes nothing. Pass the on-chain
/// `tx_hash` when known:
///
/// ```json
/// { "tx_hash": "b5f3...e1" }
/// ```
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    let outcome = payment_service::confirm_manually(
        &state,
        payment_id,
        auth.user.telegram_id,
        request.tx_hash.as_deref(),
    )
    .await?;
    Ok(Json(outcome.into()))
}

pub async fn cancel_payment(
    State(pool): State<DbPool>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(payment_service::cancel_payment(&pool, payment_id, None).await?))
}

/// `GET /api/admin/subscriptions?status=active&product_id=...`
pub async fn list_subscriptions(
    State(pool): State<DbPool>,
    Query(query): Query<SubscriptionListQuery>,
) -> Result<Json<Vec<SubscriptionView>>, AppError> {
    Ok(Json(subscription_service::list_subscriptions(&pool, &query).await?))
}

pub async fn revoke_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscription =
        subscription_service::revoke(&state.pool, &state.access, subscription_id).await?;
    Ok(Json(subscription))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StatsResponse {
    pub users: i64,
    pub active_subscriptions: i64,
    pub active_demos: i64,
    pub pending_payments: i64,
    pub successful_payments: i64,
    /// Sum of settled payments, USD cents after reductions
    pub revenue_cents: i64,
    pub revenue_cents_30d: i64,
}

/// Dashboard counters.
pub async fn stats(State(pool): State<DbPool>) -> Result<Json<StatsResponse>, AppError> {
    let stats = sqlx::query_as::<_, StatsResponse>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users) AS users,
            (SELECT COUNT(*) FROM subscriptions WHERE status = 'active') AS active_subscriptions,
            (SELECT COUNT(*) FROM demo_accesses WHERE status = 'active') AS active_demos,
            (SELECT COUNT(*) FROM payments WHERE status = 'pending') AS pending_payments,
            (SELECT COUNT(*) FROM payments WHERE status = 'success') AS successful_payments,
            (SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments WHERE status = 'success') AS revenue_cents,
            (SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments
              WHERE status = 'success' AND paid_at > NOW() - INTERVAL '30 days') AS revenue_cents_30d
        "#,
    )
    .fetch_one(&pool)
    .await?;

    Ok(Json(stats))
}
