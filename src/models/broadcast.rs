//! Broadcast models: admin-authored messages pushed to a filtered audience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::UnknownVariant;
use crate::error::AppError;

/// Who receives a broadcast. Stored as JSONB on the broadcast row.
///
/// ```json
/// { "kind": "product", "product_id": "550e8400-e29b-41d4-a716-446655440000" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastFilter {
    /// Every user who ever opened the Mini App
    All,
    /// Users with at least one active subscription
    ActiveSubscribers,
    /// Users whose subscriptions all lapsed
    ExpiredSubscribers,
    /// Active subscribers of one product
    Product { product_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Sending,
    Completed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Draft => "draft",
            BroadcastStatus::Sending => "sending",
            BroadcastStatus::Completed => "completed",
        }
    }
}

impl TryFrom<String> for BroadcastStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "draft" => Ok(BroadcastStatus::Draft),
            "sending" => Ok(BroadcastStatus::Sending),
            "completed" => Ok(BroadcastStatus::Completed),
            _ => Err(UnknownVariant {
                kind: "broadcast status",
                value,
            }),
        }
    }
}

/// Represents a broadcast record from the database.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Broadcast {
    pub id: Uuid,
    pub text: String,
    pub filter: Json<BroadcastFilter>,
    #[sqlx(try_from = "String")]
    pub status: BroadcastStatus,
    pub created_by: i64,
    pub sent_count: i32,
    pub failed_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of delivering a broadcast to one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(UnknownVariant {
                kind: "delivery status",
                value,
            }),
        }
    }
}

/// Per-recipient delivery record.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct BroadcastMessage {
    pub id: Uuid,
    pub broadcast_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Request body for `POST /api/admin/broadcasts`.
#[derive(Debug, Deserialize)]
pub struct CreateBroadcastRequest {
    pub text: String,
    pub filter: BroadcastFilter,
}

impl CreateBroadcastRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        // Telegram rejects messages above 4096 characters.
        let len = self.text.chars().count();
        if len == 0 || len > 4096 {
            return Err(AppError::InvalidRequest(
                "Text must be 1-4096 characters".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_uses_kind_tag() {
        let product_id = Uuid::new_v4();
        let filter: BroadcastFilter = serde_json::from_value(serde_json::json!({
            "kind": "product",
            "product_id": product_id,
        }))
        .unwrap();
        assert_eq!(filter, BroadcastFilter::Product { product_id });

        let all = serde_json::to_value(BroadcastFilter::All).unwrap();
        assert_eq!(all, serde_json::json!({ "kind": "all" }));
    }

    #[test]
    fn text_length_is_bounded() {
        let req = CreateBroadcastRequest {
            text: "x".repeat(4097),
            filter: BroadcastFilter::All,
        };
        assert!(req.validate().is_err());
    }
}
