//! Payment creation and lookup.
//!
//! A payment is created `pending` with a unique memo and a deadline. What
//! happens next depends on the method:
//! - `ton` / `usdt`: the buyer transfers to the shop wallet with the memo as
//!   comment; the TON monitor (or client polling) settles it
//! - `nowpayments`: a hosted invoice is created with the memo as `order_id`;
//!   the IPN settles it
//!
//! A promo code that brings the price to zero settles the payment right away.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::models::marketing::{Discount, PromoCode};
use crate::models::payment::{CreatePaymentRequest, Payment, PaymentListQuery, PaymentMethod, PaymentStatus};
use crate::models::product::Product;
use crate::models::user::User;
use crate::services::pricing::{self, Quote};
use crate::services::reconciler::{self, SettleOutcome, SettleRequest, SettlementSource};
use crate::state::AppState;

/// Attempts at drawing a memo that is not taken yet.
const MEMO_ATTEMPTS: usize = 3;

/// Short, unambiguous transfer comment: `sub-` and 10 lowercase hex digits.
pub fn generate_memo() -> String {
    let bytes: [u8; 5] = rand::random();
    format!("sub-{}", hex::encode(bytes))
}

/// Reject methods the deployment is not configured for.
pub fn ensure_method_available(
    config: &Config,
    nowpayments_configured: bool,
    method: PaymentMethod,
) -> Result<(), AppError> {
    let available = match method {
        PaymentMethod::Ton => config.ton_enabled(),
        PaymentMethod::Usdt => config.ton_enabled() && config.usdt_jetton_master.is_some(),
        PaymentMethod::Nowpayments => nowpayments_configured,
    };
    if available {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(format!(
            "Payment method {} is not available",
            method.as_str()
        )))
    }
}

pub async fn find_active_product(pool: &DbPool, product_id: Uuid) -> Result<Product, AppError> {
    sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1 AND is_active = TRUE")
        .bind(product_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Product"))
}

/// Look up a promo code case-insensitively.
pub async fn find_promo_code(pool: &DbPool, code: &str) -> Result<Option<PromoCode>, AppError> {
    let promo = sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes WHERE UPPER(code) = UPPER($1)")
        .bind(code.trim())
        .fetch_optional(pool)
        .await?;
    Ok(promo)
}

/// Price a product for the caller, optionally with a promo code.
pub async fn quote_product(
    pool: &DbPool,
    product: &Product,
    promo_code: Option<&str>,
) -> Result<Quote, AppError> {
    let discounts =
        sqlx::query_as::<_, Discount>("SELECT * FROM discounts WHERE product_id = $1 AND is_active = TRUE")
            .bind(product.id)
            .fetch_all(pool)
            .await?;

    let promo = match promo_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => Some(
            find_promo_code(pool, code)
                .await?
                .ok_or_else(|| AppError::InvalidRequest("Unknown promo code".to_string()))?,
        ),
        None => None,
    };

    pricing::quote(product, &discounts, promo.as_ref(), Utc::now())
        .map_err(|rejection| AppError::InvalidRequest(rejection.message().to_string()))
}

/// Create a pending payment for `user`.
///
/// # Errors
///
/// - `NotFound`: product does not exist or is inactive
/// - `InvalidRequest`: method unavailable, promo code rejected, or the
///   product has no price in the chosen asset
/// - `Upstream`: NOWPayments refused to create the invoice
pub async fn create_payment(
    state: &AppState,
    user: &User,
    request: CreatePaymentRequest,
) -> Result<Payment, AppError> {
    ensure_method_available(&state.config, state.nowpayments.is_configured(), request.method)?;

    let product = find_active_product(&state.pool, request.product_id).await?;
    let quote = quote_product(&state.pool, &product, request.promo_code.as_deref()).await?;

    let expected_amount = quote.expected_amount(request.method);
    if !quote.is_free() && expected_amount <= 0 {
        return Err(AppError::InvalidRequest(format!(
            "{} cannot be paid with {}",
            product.name,
            request.method.as_str()
        )));
    }

    let expires_at = Utc::now() + Duration::minutes(state.config.payment_ttl_minutes);
    let payment = insert_pending(&state.pool, user.id, &quote, request.method, expected_amount, expires_at).await?;

    tracing::info!(
        payment_id = %payment.id,
        memo = %payment.memo,
        method = payment.method.as_str(),
        amount_cents = payment.amount_cents,
        telegram_id = user.telegram_id,
        "payment created"
    );

    if quote.is_free() {
        let settled = reconciler::settle(
            &state.pool,
            &state.access,
            SettleRequest {
                payment_id: payment.id,
                evidence: format!("free:{}", payment.id),
                source: SettlementSource::Free,
                provider_status: None,
            },
        )
        .await;
        return match settled {
            Ok(outcome) => Ok(outcome.payment().clone()),
            Err(e) => {
                reconciler::close_payment(&state.pool, payment.id, PaymentStatus::Failed, None).await?;
                Err(e)
            }
        };
    }

    if request.method == PaymentMethod::Nowpayments {
        return attach_invoice(state, payment, &product).await;
    }

    Ok(payment)
}

async fn insert_pending(
    pool: &DbPool,
    user_id: Uuid,
    quote: &Quote,
    method: PaymentMethod,
    expected_amount: i64,
    expires_at: chrono::DateTime<Utc>,
) -> Result<Payment, AppError> {
    let mut last_err = None;
    for _ in 0..MEMO_ATTEMPTS {
        let result = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                user_id, product_id, method, status, memo,
                base_amount_cents, amount_cents, expected_amount,
                promo_code_id, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(quote.product_id)
        .bind(method.as_str())
        .bind(PaymentStatus::Pending.as_str())
        .bind(generate_memo())
        .bind(quote.base_amount_cents)
        .bind(quote.amount_cents)
        .bind(expected_amount)
        .bind(quote.promo_code_id)
        .bind(expires_at)
        .fetch_one(pool)
        .await;

        match result {
            Ok(payment) => return Ok(payment),
            Err(e) if db::is_unique_violation(&e) => {
                tracing::warn!("memo collision, drawing a new one");
                last_err = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_err.map(AppError::from).unwrap_or_else(|| {
        AppError::Conflict("Could not allocate a payment memo".to_string())
    }))
}

/// Create the hosted invoice and store its id and URL on the payment.
async fn attach_invoice(
    state: &AppState,
    payment: Payment,
    product: &Product,
) -> Result<Payment, AppError> {
    let callback = state.config.ipn_callback_url();
    let invoice = match state
        .nowpayments
        .create_invoice(&payment.memo, &product.name, payment.amount_cents, callback.as_deref())
        .await
    {
        Ok(invoice) => invoice,
        Err(e) => {
            tracing::error!(payment_id = %payment.id, error = %e, "NOWPayments invoice failed");
            reconciler::close_payment(&state.pool, payment.id, PaymentStatus::Failed, None).await?;
            return Err(e);
        }
    };

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET provider_invoice_id = $2, invoice_url = $3, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment.id)
    .bind(&invoice.id)
    .bind(&invoice.invoice_url)
    .fetch_one(&state.pool)
    .await?;

    Ok(payment)
}

/// Fetch a payment owned by `user_id`. Other users' payments are reported as missing.
pub async fn get_payment_for_user(
    pool: &DbPool,
    user_id: Uuid,
    payment_id: Uuid,
) -> Result<Payment, AppError> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 AND user_id = $2")
        .bind(payment_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Payment"))
}

pub async fn list_user_payments(pool: &DbPool, user_id: Uuid) -> Result<Vec<Payment>, AppError> {
    let payments = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC LIMIT 50",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(payments)
}

/// Admin listing, newest first.
pub async fn list_payments(pool: &DbPool, query: &PaymentListQuery) -> Result<Vec<Payment>, AppError> {
    let payments = sqlx::query_as::<_, Payment>(
        r#"
        SELECT * FROM payments
        WHERE ($1::TEXT IS NULL OR status = $1)
          AND ($2::UUID IS NULL OR user_id = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(query.status.map(|s| s.as_str()))
    .bind(query.user_id)
    .bind(query.limit.clamp(1, 500))
    .fetch_all(pool)
    .await?;
    Ok(payments)
}

/// Cancel a pending payment. With `owner` set, only that user's payment.
pub async fn cancel_payment(
    pool: &DbPool,
    payment_id: Uuid,
    owner: Option<Uuid>,
) -> Result<Payment, AppError> {
    if let Some(user_id) = owner {
        get_payment_for_user(pool, user_id, payment_id).await?;
    }
    reconciler::close_payment(pool, payment_id, PaymentStatus::Cancelled, None).await
}

/// Settle a payment on an admin's word.
///
/// When the admin has the on-chain hash it becomes the evidence, so the TON
/// monitor recognizes the same transfer later and cannot settle it twice.
pub async fn confirm_manually(
    state: &AppState,
    payment_id: Uuid,
    admin_telegram_id: i64,
    tx_hash: Option<&str>,
) -> Result<SettleOutcome, AppError> {
    let evidence = manual_evidence(payment_id, admin_telegram_id, tx_hash);
    tracing::info!(%payment_id, admin_telegram_id, %evidence, "manual confirmation");
    reconciler::settle(
        &state.pool,
        &state.access,
        SettleRequest {
            payment_id,
            evidence,
            source: SettlementSource::Admin,
            provider_status: None,
        },
    )
    .await
}

fn manual_evidence(payment_id: Uuid, admin_telegram_id: i64, tx_hash: Option<&str>) -> String {
    match tx_hash.map(str::trim).filter(|h| !h.is_empty()) {
        Some(hash) => format!("ton:{hash}"),
        None => format!("manual:{admin_telegram_id}:{payment_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn memo_has_prefix_and_ten_hex_digits() {
        let memo = generate_memo();
        let digits = memo.strip_prefix("sub-").unwrap();
        assert_eq!(digits.len(), 10);
        assert!(digits.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(generate_memo(), generate_memo());
    }

    #[test]
    fn methods_follow_configuration() {
        let mut config = test_config();
        assert!(ensure_method_available(&config, false, PaymentMethod::Ton).is_ok());
        assert!(ensure_method_available(&config, false, PaymentMethod::Usdt).is_ok());
        assert!(ensure_method_available(&config, false, PaymentMethod::Nowpayments).is_err());
        assert!(ensure_method_available(&config, true, PaymentMethod::Nowpayments).is_ok());

        config.usdt_jetton_master = None;
        assert!(ensure_method_available(&config, false, PaymentMethod::Usdt).is_err());

        config.ton_wallet_address = None;
        assert!(matches!(
            ensure_method_available(&config, false, PaymentMethod::Ton),
            Err(AppError::InvalidRequest(msg)) if msg.contains("ton")
        ));
    }

    #[test]
    fn manual_evidence_prefers_the_chain_hash() {
        let id = Uuid::new_v4();
        assert_eq!(manual_evidence(id, 42, Some(" abc ")), "ton:abc");
        assert_eq!(manual_evidence(id, 42, Some("")), format!("manual:42:{id}"));
        assert_eq!(manual_evidence(id, 42, None), format!("manual:42:{id}"));
    }
}
