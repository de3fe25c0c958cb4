//! Payment endpoints for Mini App users.
//!
//! - POST /api/payments              - Start a payment
//! - GET  /api/payments              - The caller's recent payments
//! - GET  /api/payments/{id}         - Poll one payment
//! - POST /api/payments/{id}/cancel  - Abandon a pending payment

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::payment::{CreatePaymentRequest, PaymentResponse, PaymentStatus};
use crate::services::{payment_service, ton_monitor};
use crate::state::AppState;

/// Create a payment.
///
/// # Request Body
///
/// ```json
/// {
///   "product_id": "550e8400-e29b-41d4-a716-446655440000",
///   "method": "ton",
///   "promo_code": "SPRING25"
/// }
/// ```
///
/// # Response (201 Created)
///
/// The payment with `instructions`: a transfer (address, asset, amount in
/// the smallest unit, comment) for `ton` / `usdt`, or a checkout URL for
/// `nowpayments`. A promo code covering the full price returns the payment
/// already `success`.
pub async fn create_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let payment = payment_service::create_payment(&state, &auth.user, request).await?;
    let response = PaymentResponse::new(payment, state.config.ton_wallet_address.as_deref());
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_my_payments(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<PaymentResponse>>, AppError> {
    let wallet = state.config.ton_wallet_address.as_deref();
    let payments = payment_service::list_user_payments(&state.pool, auth.user.id).await?;
    Ok(Json(
        payments
            .into_iter()
            .map(|p| PaymentResponse::new(p, wallet))
            .collect(),
    ))
}

/// Poll a payment.
///
/// A pending TON or USDT payment is checked against the chain first, so the
/// buyer sees `success` as soon as the transfer lands instead of waiting for
/// the next monitor pass. A failed chain lookup is logged and the stored
/// status returned.
pub async fn get_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let mut payment =
        payment_service::get_payment_for_user(&state.pool, auth.user.id, payment_id).await?;

    if payment.status == PaymentStatus::Pending && payment.method.is_on_chain() {
        match ton_monitor::check_payment(&state, &payment).await {
            Ok(true) => {
                payment =
                    payment_service::get_payment_for_user(&state.pool, auth.user.id, payment_id)
                        .await?;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(%payment_id, error = %e, "on-demand chain check failed"),
        }
    }

    Ok(Json(PaymentResponse::new(
        payment,
        state.config.ton_wallet_address.as_deref(),
    )))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = payment_service::cancel_payment(&state.pool, payment_id, Some(auth.user.id)).await?;
    Ok(Json(PaymentResponse::new(
        payment,
        state.config.ton_wallet_address.as_deref(),
    )))
}
