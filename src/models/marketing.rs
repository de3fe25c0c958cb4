//! Discount and promo code models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Automatic percentage discount on one product, optionally time-boxed.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Discount {
    pub id: Uuid,
    pub product_id: Uuid,
    pub percent_off: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Discount {
    /// Whether the discount applies at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.starts_at.is_none_or(|start| start <= now)
            && self.ends_at.is_none_or(|end| now < end)
    }
}

/// Code the buyer types in at checkout.
///
/// Exactly one of `percent_off` / `amount_off_cents` is set (enforced by a
/// table constraint). Codes compare case-insensitively.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub percent_off: Option<i32>,
    pub amount_off_cents: Option<i64>,
    /// Restricts the code to one product when set
    pub product_id: Option<Uuid>,
    pub max_uses: Option<i32>,
    /// Incremented when a payment using the code settles
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Why a promo code cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoRejection {
    Inactive,
    Expired,
    Exhausted,
    WrongProduct,
}

impl PromoRejection {
    pub fn message(&self) -> &'static str {
        match self {
            PromoRejection::Inactive => "Promo code is not active",
            PromoRejection::Expired => "Promo code has expired",
            PromoRejection::Exhausted => "Promo code has been used up",
            PromoRejection::WrongProduct => "Promo code does not apply to this product",
        }
    }
}

impl PromoCode {
    /// Check whether the code can be applied to `product_id` at `now`.
    pub fn check(&self, product_id: Uuid, now: DateTime<Utc>) -> Result<(), PromoRejection> {
        if !self.is_active {
            return Err(PromoRejection::Inactive);
        }
        if self.expires_at.is_some_and(|expires| expires <= now) {
            return Err(PromoRejection::Expired);
        }
        if self.max_uses.is_some_and(|max| self.used_count >= max) {
            return Err(PromoRejection::Exhausted);
        }
        if self.product_id.is_some_and(|scope| scope != product_id) {
            return Err(PromoRejection::WrongProduct);
        }
        Ok(())
    }
}

/// Request body for `POST /api/admin/discounts`.
#[derive(Debug, Deserialize)]
pub struct CreateDiscountRequest {
    pub product_id: Uuid,
    pub percent_off: i32,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl CreateDiscountRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_percent(self.percent_off)?;
        if let (Some(start), Some(end)) = (self.starts_at, self.ends_at) {
            if end <= start {
                return Err(AppError::InvalidRequest(
                    "ends_at must be after starts_at".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Request body for `POST /api/admin/promo-codes`.
///
/// ```json
/// { "code": "SPRING25", "percent_off": 25, "max_uses": 100 }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreatePromoCodeRequest {
    pub code: String,
    #[serde(default)]
    pub percent_off: Option<i32>,
    #[serde(default)]
    pub amount_off_cents: Option<i64>,
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub max_uses: Option<i32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreatePromoCodeRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        let code = self.code.trim();
        if code.is_empty() || code.len() > 64 {
            return Err(AppError::InvalidRequest(
                "Code must be 1-64 characters".to_string(),
            ));
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::InvalidRequest(
                "Code may only contain letters, digits, '-' and '_'".to_string(),
            ));
        }
        match (self.percent_off, self.amount_off_cents) {
            (Some(percent), None) => validate_percent(percent)?,
            (None, Some(amount)) if amount > 0 => {}
            (None, Some(_)) => {
                return Err(AppError::InvalidRequest(
                    "amount_off_cents must be positive".to_string(),
                ));
            }
            _ => {
                return Err(AppError::InvalidRequest(
                    "Set exactly one of percent_off or amount_off_cents".to_string(),
                ));
            }
        }
        if matches!(self.max_uses, Some(max) if max <= 0) {
            return Err(AppError::InvalidRequest(
                "max_uses must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request body for toggling discounts and promo codes.
#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

/// Request body for `POST /api/promo/validate`.
#[derive(Debug, Deserialize)]
pub struct ValidatePromoRequest {
    pub code: String,
    pub product_id: Uuid,
}

fn validate_percent(percent: i32) -> Result<(), AppError> {
    if !(1..=100).contains(&percent) {
        return Err(AppError::InvalidRequest(
            "percent_off must be between 1 and 100".to_string(),
        ));
    }
    Ok(())
}
