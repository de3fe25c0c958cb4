//! Subscription data models and the subscription status lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownVariant;
use crate::error::AppError;

/// Subscription status.
///
/// There is one subscription row per (user, product); buying again reuses it.
///
/// - `Active -> Active`: renewal extends `ends_at`
/// - `Active -> Expired`: `ends_at` passed
/// - `Active -> Revoked`: admin took access away
/// - `Expired | Revoked -> Active`: bought again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Revoked,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Revoked => "revoked",
        }
    }

    pub fn can_transition_to(&self, target: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, target),
            (Active, Active)
                | (Active, Expired)
                | (Active, Revoked)
                | (Expired, Active)
                | (Revoked, Active)
        )
    }

    pub fn transition_to(&self, target: SubscriptionStatus) -> Result<SubscriptionStatus, AppError> {
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

impl TryFrom<String> for SubscriptionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "revoked" => Ok(SubscriptionStatus::Revoked),
            _ => Err(UnknownVariant {
                kind: "subscription status",
                value,
            }),
        }
    }
}

/// Represents a subscription record from the database.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub last_payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active but past its end date.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.ends_at <= now
    }
}

/// New validity window for a subscription that was just paid for.
///
/// An active subscription is extended from its current end (or from now if
/// that end already passed without the sweeper noticing); anything else
/// restarts at `now`.
pub fn renewal_window(
    existing: Option<&Subscription>,
    duration_days: i32,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let duration = Duration::days(i64::from(duration_days));
    match existing {
        Some(sub) if sub.status == SubscriptionStatus::Active => {
            let from = sub.ends_at.max(now);
            (sub.starts_at, from + duration)
        }
        _ => (now, now + duration),
    }
}

/// Subscription joined with its product name, as shown to users and admins.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub telegram_id: i64,
    pub product_id: Uuid,
    pub product_name: String,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Query string for the admin subscription list.
#[derive(Debug, Deserialize)]
pub struct SubscriptionListQuery {
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub product_id: Option<Uuid>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn subscription(status: SubscriptionStatus, ends_at: DateTime<Utc>) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            status,
            starts_at: now - Duration::days(10),
            ends_at,
            last_payment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn renewal_extends_an_active_subscription_from_its_end() {
        let now = Utc::now();
        let current_end = now + Duration::days(5);
        let sub = subscription(SubscriptionStatus::Active, current_end);

        let (starts, ends) = renewal_window(Some(&sub), 30, now);
        assert_eq!(starts, sub.starts_at);
        assert_eq!(ends, current_end + Duration::days(30));
    }

    #[test]
    fn overdue_active_subscription_extends_from_now() {
        let now = Utc::now();
        let sub = subscription(SubscriptionStatus::Active, now - Duration::days(2));

        let (_, ends) = renewal_window(Some(&sub), 30, now);
        assert_eq!(ends, now + Duration::days(30));
    }

    #[test]
    fn expired_or_missing_subscription_restarts_now() {
        let now = Utc::now();
        let sub = subscription(SubscriptionStatus::Expired, now - Duration::days(2));

        assert_eq!(
            renewal_window(Some(&sub), 7, now),
            (now, now + Duration::days(7))
        );
        assert_eq!(renewal_window(None, 7, now), (now, now + Duration::days(7)));
    }

    #[test]
    fn revoked_subscriptions_only_come_back_through_purchase() {
        assert!(SubscriptionStatus::Revoked.can_transition_to(SubscriptionStatus::Active));
        assert!(!SubscriptionStatus::Revoked.can_transition_to(SubscriptionStatus::Expired));
        assert!(!SubscriptionStatus::Expired.can_transition_to(SubscriptionStatus::Revoked));
        assert!(SubscriptionStatus::Expired
            .transition_to(SubscriptionStatus::Revoked)
            .is_err());
    }
}
