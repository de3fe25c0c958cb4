//! Inbound provider webhooks.
//!
//! `POST /api/webhooks/nowpayments` receives NOWPayments IPN callbacks. The
//! raw body is needed for signature verification, so it is taken as
//! `Bytes` and parsed only after the signature checks out.
//!
//! NOWPayments retries until it gets a 2xx. Anything that retrying cannot
//! fix (unknown order, payment closed locally, evidence already used) is
//! logged and acknowledged.

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};

use crate::error::AppError;
use crate::models::payment::{PaymentMethod, PaymentStatus};
use crate::services::nowpayments::{self, IpnAction, IpnPayload};
use crate::services::reconciler::{self, SettleOutcome, SettleRequest, SettlementSource};
use crate::state::AppState;

pub async fn nowpayments_ipn(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let Some(secret) = state.config.nowpayments_ipn_secret.as_deref() else {
        tracing::warn!("IPN received but NOWPAYMENTS_IPN_SECRET is not set");
        return Err(AppError::InvalidSignature);
    };
    let signature = headers
        .get(nowpayments::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    if let Err(e) = nowpayments::verify_ipn_signature(secret, &body, signature) {
        tracing::warn!("IPN signature mismatch");
        return Err(e);
    }

    let payload: IpnPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidRequest(format!("Malformed IPN body: {e}")))?;

    tracing::info!(
        order_id = %payload.order_id,
        provider_payment_id = %payload.payment_id,
        status = %payload.payment_status,
        pay_currency = ?payload.pay_currency,
        actually_paid = ?payload.actually_paid,
        "IPN received"
    );

    match apply_ipn(&state, &payload).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) if acknowledges(&e) => {
            tracing::error!(
                order_id = %payload.order_id,
                status = %payload.payment_status,
                error = %e,
                "IPN could not be applied, needs manual review"
            );
            Ok(StatusCode::OK)
        }
        Err(e) => Err(e),
    }
}

/// Errors a redelivery cannot fix. They are acknowledged so NOWPayments
/// stops retrying; everything else surfaces so it tries again later.
fn acknowledges(error: &AppError) -> bool {
    matches!(
        error,
        AppError::InvalidTransition { .. } | AppError::Conflict(_)
    )
}

async fn apply_ipn(state: &AppState, payload: &IpnPayload) -> Result<(), AppError> {
    let Some(payment) = reconciler::find_by_memo(&state.pool, &payload.order_id).await? else {
        tracing::warn!(order_id = %payload.order_id, "IPN for unknown order");
        return Ok(());
    };
    if payment.method != PaymentMethod::Nowpayments {
        tracing::warn!(payment_id = %payment.id, "IPN for a payment of another method");
        return Ok(());
    }

    let provider_status = payload.payment_status.as_str();
    match nowpayments::ipn_action(provider_status) {
        IpnAction::Settle => {
            let outcome = reconciler::settle(
                &state.pool,
                &state.access,
                SettleRequest {
                    payment_id: payment.id,
                    evidence: payload.evidence(),
                    source: SettlementSource::Ipn,
                    provider_status: Some(provider_status.to_string()),
                },
            )
            .await?;
            if let SettleOutcome::AlreadySettled { .. } = outcome {
                tracing::debug!(payment_id = %payment.id, "duplicate IPN ignored");
            }
        }
        IpnAction::Fail => {
            reconciler::close_payment(&state.pool, payment.id, PaymentStatus::Failed, Some(provider_status))
                .await?;
        }
        IpnAction::Expire => {
            reconciler::close_payment(&state.pool, payment.id, PaymentStatus::Expired, Some(provider_status))
                .await?;
        }
        IpnAction::Track => {
            reconciler::record_provider_status(&state.pool, payment.id, provider_status).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::services::nowpayments::tests::sign_ipn;
    use crate::services::telegram::tests::FakeTelegram;
    use crate::services::ton_explorer::tests::FakeExplorer;
    use crate::state::tests::test_state;
    use axum::{Router, body::Body, http::Request, routing::post};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(ipn_secret: Option<&str>) -> Router {
        let mut config = test_config();
        config.nowpayments_ipn_secret = ipn_secret.map(str::to_string);
        let state = test_state(
            config,
            Arc::new(FakeExplorer::default()),
            Arc::new(FakeTelegram::default()),
        );
        Router::new()
            .route("/api/webhooks/nowpayments", post(nowpayments_ipn))
            .with_state(state)
    }

    async fn post_ipn(app: Router, body: &str, signature: Option<&str>) -> StatusCode {
        let mut request = Request::post("/api/webhooks/nowpayments")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header(nowpayments::SIGNATURE_HEADER, signature);
        }
        app.oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn rejected_without_a_configured_secret() {
        let body = json!({ "payment_id": 1, "payment_status": "finished", "order_id": "sub-1" });
        let signature = sign_ipn("ipn-secret", &body);
        let status = post_ipn(app(None), &body.to_string(), Some(&signature)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejected_without_a_signature_header() {
        let body = json!({ "payment_id": 1, "payment_status": "finished", "order_id": "sub-1" });
        let status = post_ipn(app(Some("ipn-secret")), &body.to_string(), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejected_with_a_wrong_signature() {
        let body = json!({ "payment_id": 1, "payment_status": "finished", "order_id": "sub-1" });
        let signature = sign_ipn("someone-else", &body);
        let status = post_ipn(app(Some("ipn-secret")), &body.to_string(), Some(&signature)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_body_missing_fields_is_a_bad_request() {
        let body = json!({ "payment_status": "finished" });
        let signature = sign_ipn("ipn-secret", &body);
        let status = post_ipn(app(Some("ipn-secret")), &body.to_string(), Some(&signature)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn closed_payments_and_reused_evidence_are_acknowledged() {
        assert!(acknowledges(&AppError::InvalidTransition {
            from: "cancelled".to_string(),
            to: "success".to_string(),
        }));
        assert!(acknowledges(&AppError::Conflict(
            "Transaction already settled another payment".to_string()
        )));
    }

    #[test]
    fn transient_failures_are_retried_by_the_provider() {
        assert!(!acknowledges(&AppError::Database(sqlx::Error::PoolTimedOut)));
        assert!(!acknowledges(&AppError::Upstream("telegram down".to_string())));
        assert!(!acknowledges(&AppError::NotFound("Payment")));
    }
}
