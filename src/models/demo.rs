//! Demo (trial) access model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoStatus {
    Active,
    Expired,
}

impl DemoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DemoStatus::Active => "active",
            DemoStatus::Expired => "expired",
        }
    }
}

impl TryFrom<String> for DemoStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(DemoStatus::Active),
            "expired" => Ok(DemoStatus::Expired),
            _ => Err(UnknownVariant {
                kind: "demo status",
                value,
            }),
        }
    }
}

/// A one-time trial of a product's channels.
///
/// At most one row per (user, product): a demo can never be claimed twice.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DemoAccess {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: DemoStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
