//! Payment data models and the payment status lifecycle.
//!
//! This module defines:
//! - `PaymentMethod`: how the buyer pays (TON, USDT jetton, NOWPayments checkout)
//! - `PaymentStatus`: closed set of statuses with explicit allowed transitions
//! - `Payment`: database entity
//! - Request/response bodies for the payment endpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownVariant;
use crate::error::AppError;

/// How a payment is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Native TON transfer to the shop wallet with the memo as comment.
    Ton,
    /// USDT jetton transfer to the shop wallet with the memo as comment.
    Usdt,
    /// Hosted checkout; settlement arrives as an IPN.
    Nowpayments,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Ton => "ton",
            PaymentMethod::Usdt => "usdt",
            PaymentMethod::Nowpayments => "nowpayments",
        }
    }

    /// Whether settlement is detected by polling the TON chain.
    pub fn is_on_chain(&self) -> bool {
        matches!(self, PaymentMethod::Ton | PaymentMethod::Usdt)
    }
}

impl TryFrom<String> for PaymentMethod {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ton" => Ok(PaymentMethod::Ton),
            "usdt" => Ok(PaymentMethod::Usdt),
            "nowpayments" => Ok(PaymentMethod::Nowpayments),
            _ => Err(UnknownVariant {
                kind: "payment method",
                value,
            }),
        }
    }
}

/// Payment status.
///
/// ```text
/// pending ──► success
///    │  ├──► failed
///    │  ├──► cancelled
///    └──────► expired ──► success   (funds arrived after the deadline)
/// ```
///
/// `success`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Expired,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, target),
            (Pending, Success)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Expired, Success)
        )
    }

    /// Validate a transition, returning the target status.
    pub fn transition_to(&self, target: PaymentStatus) -> Result<PaymentStatus, AppError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(AppError::InvalidTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            _ => Err(UnknownVariant {
                kind: "payment status",
                value,
            }),
        }
    }
}

/// Represents a payment record from the database.
///
/// # Amounts
///
/// - `base_amount_cents`: product price in USD cents before any reduction
/// - `amount_cents`: price after discount and promo code
/// - `expected_amount`: what must arrive, in the smallest unit of the asset
///   (nanotons for TON, micro-USDT for USDT, cents for NOWPayments)
///
/// # Correlation
///
/// - `memo` is the comment the buyer puts on the on-chain transfer and the
///   `order_id` sent to NOWPayments
/// - `provider_tx_id` is the evidence that settled the payment; a unique
///   index guarantees one transfer can never settle two payments
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub memo: String,
    pub base_amount_cents: i64,
    pub amount_cents: i64,
    pub expected_amount: i64,
    pub promo_code_id: Option<Uuid>,
    pub provider_invoice_id: Option<String>,
    pub invoice_url: Option<String>,
    pub provider_tx_id: Option<String>,
    pub provider_status: Option<String>,
    /// Which path settled it: `ipn`, `ton_monitor`, `client_poll`, `admin`.
    pub settled_by: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for `POST /api/payments`.
///
/// ```json
/// {
///   "product_id": "550e8400-e29b-41d4-a716-446655440000",
///   "method": "ton",
///   "promo_code": "SPRING25"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub product_id: Uuid,
    pub method: PaymentMethod,
    #[serde(default)]
    pub promo_code: Option<String>,
}

/// Where and how much the buyer has to send.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentInstructions {
    /// Transfer `amount` (smallest unit) to `address` with `comment`.
    Transfer {
        address: String,
        asset: &'static str,
        amount: i64,
        comment: String,
    },
    /// Open the hosted checkout page.
    Checkout { url: String },
}

/// Response body for payment endpoints.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub memo: String,
    pub base_amount_cents: i64,
    pub amount_cents: i64,
    pub expected_amount: i64,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<PaymentInstructions>,
    pub created_at: DateTime<Utc>,
}

impl PaymentResponse {
    /// Build a response, attaching instructions while the payment is still payable.
    pub fn new(payment: Payment, ton_wallet: Option<&str>) -> Self {
        let instructions = if payment.status == PaymentStatus::Pending {
            match payment.method {
                PaymentMethod::Ton | PaymentMethod::Usdt => {
                    ton_wallet.map(|address| PaymentInstructions::Transfer {
                        address: address.to_string(),
                        asset: if payment.method == PaymentMethod::Ton {
                            "TON"
                        } else {
                            "USDT"
                        },
                        amount: payment.expected_amount,
                        comment: payment.memo.clone(),
                    })
                }
                PaymentMethod::Nowpayments => payment
                    .invoice_url
                    .clone()
                    .map(|url| PaymentInstructions::Checkout { url }),
            }
        } else {
            None
        };

        Self {
            id: payment.id,
            product_id: payment.product_id,
            method: payment.method,
            status: payment.status,
            memo: payment.memo,
            base_amount_cents: payment.base_amount_cents,
            amount_cents: payment.amount_cents,
            expected_amount: payment.expected_amount,
            expires_at: payment.expires_at,
            paid_at: payment.paid_at,
            instructions,
            created_at: payment.created_at,
        }
    }
}

/// Request body for `POST /api/admin/payments/{id}/confirm`. Send `{}` when
/// there is no transaction hash.
#[derive(Debug, Default, Deserialize)]
pub struct ConfirmPaymentRequest {
    #[serde(default)]
    pub tx_hash: Option<String>,
}

/// Query string for the admin payment list.
#[derive(Debug, Deserialize)]
pub struct PaymentListQuery {
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}
