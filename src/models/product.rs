//! Product and channel models.
//!
//! A product is what users buy: a fixed-length subscription that unlocks a
//! set of Telegram channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Represents a product record from the database.
///
/// # Prices
///
/// - `price_cents`: USD price in cents, used for USDT and NOWPayments
/// - `ton_price_nano`: TON price in nanotons (1 TON = 10^9), set by the admin
///   because the TON/USD rate moves
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub ton_price_nano: i64,
    pub duration_days: i32,
    /// Trial length; `None` means the product has no demo.
    pub demo_days: Option<i32>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A gated Telegram channel or supergroup the bot administers.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Channel {
    pub id: Uuid,
    pub telegram_chat_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Product with its channels, as returned by the product endpoints.
#[derive(Debug, Serialize)]
pub struct ProductResponse {
    #[serde(flatten)]
    pub product: Product,
    pub channels: Vec<ChannelSummary>,
}

/// Channel as shown to buyers (no chat id).
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: Uuid,
    pub title: String,
}

impl From<Channel> for ChannelSummary {
    fn from(channel: Channel) -> Self {
        Self {
            id: channel.id,
            title: channel.title,
        }
    }
}

/// Request body for `POST /api/admin/products`.
///
/// ```json
/// {
///   "name": "VIP signals",
///   "price_cents": 1999,
///   "ton_price_nano": 4000000000,
///   "duration_days": 30,
///   "demo_days": 3
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    pub ton_price_nano: i64,
    pub duration_days: i32,
    #[serde(default)]
    pub demo_days: Option<i32>,
    #[serde(default)]
    pub sort_order: i32,
}

impl CreateProductRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidRequest("Name is required".to_string()));
        }
        validate_amounts(
            Some(self.price_cents),
            Some(self.ton_price_nano),
            Some(self.duration_days),
        )?;
        if matches!(self.demo_days, Some(days) if days <= 0) {
            return Err(AppError::InvalidRequest(
                "demo_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request body for `PATCH /api/admin/products/{id}`. Absent fields are left unchanged.
///
/// `demo_days: 0` disables the demo.
#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub ton_price_nano: Option<i64>,
    pub duration_days: Option<i32>,
    pub demo_days: Option<i32>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i32>,
}

impl UpdateProductRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if matches!(self.name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(AppError::InvalidRequest("Name cannot be empty".to_string()));
        }
        if matches!(self.demo_days, Some(days) if days < 0) {
            return Err(AppError::InvalidRequest(
                "demo_days cannot be negative".to_string(),
            ));
        }
        validate_amounts(self.price_cents, self.ton_price_nano, self.duration_days)
    }
}

fn validate_amounts(
    price_cents: Option<i64>,
    ton_price_nano: Option<i64>,
    duration_days: Option<i32>,
) -> Result<(), AppError> {
    if matches!(price_cents, Some(p) if p < 0) || matches!(ton_price_nano, Some(p) if p < 0) {
        return Err(AppError::InvalidRequest(
            "Prices cannot be negative".to_string(),
        ));
    }
    if matches!(duration_days, Some(d) if d <= 0) {
        return Err(AppError::InvalidRequest(
            "duration_days must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Request body for `PUT /api/admin/products/{id}/channels`; replaces the set.
#[derive(Debug, Deserialize)]
pub struct SetProductChannelsRequest {
    pub channel_ids: Vec<Uuid>,
}

/// Request body for `POST /api/admin/channels`.
#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub telegram_chat_id: i64,
    pub title: String,
}
