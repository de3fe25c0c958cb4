//! Admin allow-list model.
//!
//! Admins listed in `ADMIN_IDS` are always admins; this table holds the ones
//! added at runtime through the admin panel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents an admin record from the database.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Admin {
    pub id: Uuid,
    pub telegram_id: i64,
    /// Telegram id of the admin who granted the role
    pub added_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /api/admin/admins`.
#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    pub telegram_id: i64,
}
