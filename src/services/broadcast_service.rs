//! Admin broadcasts to a filtered set of users.
//!
//! A broadcast is created as a `draft`, moved to `sending` when an admin
//! starts it, delivered by a background task one message at a time, and
//! ends `completed` with sent/failed counts. Each recipient gets a
//! `broadcast_messages` row recording the outcome; broadcasts interrupted by
//! a restart are resumed from those rows at startup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::broadcast::{
    Broadcast, BroadcastFilter, BroadcastMessage, BroadcastStatus, CreateBroadcastRequest,
    DeliveryStatus,
};
use crate::services::telegram::{TelegramApi, TelegramError};
use crate::state::AppState;

/// Longest rate-limit pause honoured before giving up on a recipient.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Messages sent between progress writes.
const RECORD_BATCH: usize = 20;

const FINISH_ATTEMPTS: u32 = 3;

/// A user a broadcast goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: Uuid,
    pub telegram_id: i64,
}

pub async fn create(
    pool: &DbPool,
    created_by: i64,
    request: CreateBroadcastRequest,
) -> Result<Broadcast, AppError> {
    request.validate()?;

    let broadcast = sqlx::query_as::<_, Broadcast>(
        r#"
        INSERT INTO broadcasts (text, filter, status, created_by)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(&request.text)
    .bind(sqlx::types::Json(request.filter.clone()))
    .bind(BroadcastStatus::Draft.as_str())
    .bind(created_by)
    .fetch_one(pool)
    .await?;

    Ok(broadcast)
}

pub async fn list(pool: &DbPool) -> Result<Vec<Broadcast>, AppError> {
    let broadcasts =
        sqlx::query_as::<_, Broadcast>("SELECT * FROM broadcasts ORDER BY created_at DESC LIMIT 100")
            .fetch_all(pool)
            .await?;
    Ok(broadcasts)
}

pub async fn get(pool: &DbPool, id: Uuid) -> Result<Broadcast, AppError> {
    sqlx::query_as::<_, Broadcast>("SELECT * FROM broadcasts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Broadcast"))
}

pub async fn list_messages(pool: &DbPool, broadcast_id: Uuid) -> Result<Vec<BroadcastMessage>, AppError> {
    let messages = sqlx::query_as::<_, BroadcastMessage>(
        "SELECT * FROM broadcast_messages WHERE broadcast_id = $1 ORDER BY sent_at",
    )
    .bind(broadcast_id)
    .fetch_all(pool)
    .await?;
    Ok(messages)
}

/// Users matched by `filter`.
pub async fn resolve_recipients(
    pool: &DbPool,
    filter: &BroadcastFilter,
) -> Result<Vec<Recipient>, AppError> {
    let query = match filter {
        BroadcastFilter::All => sqlx::query_as::<_, Recipient>(
            "SELECT id AS user_id, telegram_id FROM users ORDER BY created_at",
        ),
        BroadcastFilter::ActiveSubscribers => sqlx::query_as::<_, Recipient>(
            r#"
            SELECT u.id AS user_id, u.telegram_id FROM users u
            WHERE EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status = 'active')
            ORDER BY u.created_at
            "#,
        ),
        BroadcastFilter::ExpiredSubscribers => sqlx::query_as::<_, Recipient>(
            r#"
            SELECT u.id AS user_id, u.telegram_id FROM users u
            WHERE EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status <> 'active')
              AND NOT EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status = 'active')
            ORDER BY u.created_at
            "#,
        ),
        BroadcastFilter::Product { product_id } => sqlx::query_as::<_, Recipient>(
            r#"
            SELECT u.id AS user_id, u.telegram_id FROM users u
            JOIN subscriptions s ON s.user_id = u.id
            WHERE s.product_id = $1 AND s.status = 'active'
            ORDER BY u.created_at
            "#,
        )
        .bind(*product_id),
    };

    Ok(query.fetch_all(pool).await?)
}

/// Move a draft to `sending` and deliver it in the background.
///
/// Recipients are resolved before the status changes, so a failure here
/// leaves the broadcast a draft that can be started again.
///
/// # Errors
///
/// - `NotFound`: no such broadcast
/// - `InvalidTransition`: it was already started
pub async fn start(state: &AppState, id: Uuid) -> Result<Broadcast, AppError> {
    let draft = get(&state.pool, id).await?;
    ensure_draft(&draft)?;
    let recipients = resolve_recipients(&state.pool, &draft.filter).await?;

    let started = sqlx::query_as::<_, Broadcast>(
        r#"
        UPDATE broadcasts
        SET status = $2, started_at = NOW()
        WHERE id = $1 AND status = $3
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(BroadcastStatus::Sending.as_str())
    .bind(BroadcastStatus::Draft.as_str())
    .fetch_optional(&state.pool)
    .await?;

    // Another admin started it between the read and the update.
    let broadcast = match started {
        Some(b) => b,
        None => {
            ensure_draft(&get(&state.pool, id).await?)?;
            return Err(AppError::Conflict("Broadcast changed while starting".to_string()));
        }
    };

    tracing::info!(broadcast_id = %id, recipients = recipients.len(), "broadcast started");
    spawn_delivery(state, &broadcast, recipients);
    Ok(broadcast)
}

fn ensure_draft(broadcast: &Broadcast) -> Result<(), AppError> {
    if broadcast.status == BroadcastStatus::Draft {
        return Ok(());
    }
    Err(AppError::InvalidTransition {
        from: broadcast.status.as_str().to_string(),
        to: BroadcastStatus::Sending.as_str().to_string(),
    })
}

/// Pick up broadcasts a restart left in `sending`, skipping users who
/// already have a message row. Returns how many were resumed.
pub async fn resume_interrupted(state: &AppState) -> Result<usize, AppError> {
    let sending = sqlx::query_as::<_, Broadcast>("SELECT * FROM broadcasts WHERE status = $1")
        .bind(BroadcastStatus::Sending.as_str())
        .fetch_all(&state.pool)
        .await?;

    for broadcast in &sending {
        let recipients = resolve_recipients(&state.pool, &broadcast.filter).await?;
        let reached: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM broadcast_messages WHERE broadcast_id = $1",
        )
        .bind(broadcast.id)
        .fetch_all(&state.pool)
        .await?
        .into_iter()
        .collect();

        let remaining = not_yet_reached(recipients, &reached);
        tracing::info!(broadcast_id = %broadcast.id, remaining = remaining.len(), "resuming broadcast");
        spawn_delivery(state, broadcast, remaining);
    }

    Ok(sending.len())
}

fn not_yet_reached(recipients: Vec<Recipient>, reached: &HashSet<Uuid>) -> Vec<Recipient> {
    recipients
        .into_iter()
        .filter(|r| !reached.contains(&r.user_id))
        .collect()
}

fn spawn_delivery(state: &AppState, broadcast: &Broadcast, recipients: Vec<Recipient>) {
    let pool = state.pool.clone();
    let telegram = state.access.telegram().clone();
    let delay = Duration::from_millis(state.config.broadcast_delay_ms);
    let text = broadcast.text.clone();
    let id = broadcast.id;
    tokio::spawn(async move {
        deliver(&pool, telegram, id, &text, &recipients, delay).await;
    });
}

/// Outcome of sending to one recipient.
#[derive(Debug)]
struct Delivery {
    recipient: Recipient,
    status: DeliveryStatus,
    error: Option<String>,
}

/// Send to every recipient, recording progress in batches of
/// `RECORD_BATCH`, then mark the broadcast completed. Never fails: database
/// errors are logged and the remaining recipients still get the message.
async fn deliver(
    pool: &DbPool,
    telegram: Arc<dyn TelegramApi>,
    broadcast_id: Uuid,
    text: &str,
    recipients: &[Recipient],
    delay: Duration,
) {
    let mut sent = 0usize;
    let mut failed = 0usize;

    for batch in recipients.chunks(RECORD_BATCH) {
        let deliveries = send_batch(telegram.as_ref(), text, batch, delay).await;
        for delivery in &deliveries {
            match delivery.status {
                DeliveryStatus::Sent => sent += 1,
                DeliveryStatus::Failed => failed += 1,
            }
        }
        if let Err(e) = record_deliveries(pool, broadcast_id, &deliveries).await {
            tracing::error!(%broadcast_id, error = %e, "failed to record broadcast messages");
        }
    }

    for attempt in 1..=FINISH_ATTEMPTS {
        match finish(pool, broadcast_id).await {
            Ok(()) => {
                tracing::info!(%broadcast_id, sent, failed, "broadcast completed");
                return;
            }
            Err(e) => {
                tracing::error!(%broadcast_id, attempt, error = %e, "failed to complete broadcast");
                tokio::time::sleep(Duration::from_secs(attempt.into())).await;
            }
        }
    }
}

async fn send_batch(
    telegram: &dyn TelegramApi,
    text: &str,
    batch: &[Recipient],
    delay: Duration,
) -> Vec<Delivery> {
    let mut deliveries = Vec::with_capacity(batch.len());
    for recipient in batch {
        let delivery = match send_with_retry(telegram, recipient.telegram_id, text).await {
            Ok(()) => Delivery {
                recipient: *recipient,
                status: DeliveryStatus::Sent,
                error: None,
            },
            Err(e) => {
                tracing::debug!(telegram_id = recipient.telegram_id, error = %e, "broadcast message failed");
                Delivery {
                    recipient: *recipient,
                    status: DeliveryStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        deliveries.push(delivery);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    deliveries
}

async fn record_deliveries(
    pool: &DbPool,
    broadcast_id: Uuid,
    deliveries: &[Delivery],
) -> Result<(), AppError> {
    let user_ids: Vec<Uuid> = deliveries.iter().map(|d| d.recipient.user_id).collect();
    let statuses: Vec<&str> = deliveries.iter().map(|d| d.status.as_str()).collect();
    let errors: Vec<Option<String>> = deliveries.iter().map(|d| d.error.clone()).collect();

    sqlx::query(
        r#"
        INSERT INTO broadcast_messages (broadcast_id, user_id, status, error)
        SELECT $1::UUID, * FROM UNNEST($2::UUID[], $3::TEXT[], $4::TEXT[])
        ON CONFLICT (broadcast_id, user_id) DO NOTHING
        "#,
    )
    .bind(broadcast_id)
    .bind(&user_ids)
    .bind(&statuses)
    .bind(&errors)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark completed with counts taken from the recorded messages, so a
/// resumed broadcast reports its whole audience.
async fn finish(pool: &DbPool, broadcast_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE broadcasts
        SET status = $2,
            sent_count = (SELECT COUNT(*) FROM broadcast_messages WHERE broadcast_id = $1 AND status = 'sent'),
            failed_count = (SELECT COUNT(*) FROM broadcast_messages WHERE broadcast_id = $1 AND status = 'failed'),
            completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(broadcast_id)
    .bind(BroadcastStatus::Completed.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Send once, and once more after the pause Telegram asks for when rate limited.
async fn send_with_retry(
    telegram: &dyn TelegramApi,
    chat_id: i64,
    text: &str,
) -> Result<(), TelegramError> {
    match telegram.send_message(chat_id, text).await {
        Err(e) => match e.retry_after() {
            Some(secs) if secs <= MAX_RETRY_AFTER_SECS => {
                tracing::warn!(chat_id, retry_after = secs, "rate limited, pausing broadcast");
                tokio::time::sleep(Duration::from_secs(secs)).await;
                telegram.send_message(chat_id, text).await
            }
            _ => Err(e),
        },
        ok => ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::telegram::tests::{Call, FakeTelegram};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    /// Rate limits the first message, then accepts everything.
    #[derive(Default)]
    struct RateLimitedOnce {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl TelegramApi for RateLimitedOnce {
        async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<(), TelegramError> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts == 1 {
                return Err(TelegramError::Api {
                    code: 429,
                    description: "Too Many Requests: retry after 0".to_string(),
                    retry_after: Some(0),
                });
            }
            Ok(())
        }

        async fn create_invite_link(
            &self,
            _chat_id: i64,
            _name: &str,
            _expire_at: DateTime<Utc>,
        ) -> Result<String, TelegramError> {
            unreachable!()
        }

        async fn ban_chat_member(&self, _chat_id: i64, _user_id: i64) -> Result<(), TelegramError> {
            unreachable!()
        }

        async fn unban_chat_member(
            &self,
            _chat_id: i64,
            _user_id: i64,
            _only_if_banned: bool,
        ) -> Result<(), TelegramError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn rate_limited_message_is_retried_once() {
        let telegram = RateLimitedOnce::default();
        assert!(send_with_retry(&telegram, 1, "hi").await.is_ok());
        assert_eq!(*telegram.attempts.lock().unwrap(), 2);
    }

    fn recipient(telegram_id: i64) -> Recipient {
        Recipient {
            user_id: Uuid::new_v4(),
            telegram_id,
        }
    }

    #[tokio::test]
    async fn failed_recipient_does_not_stop_the_batch() {
        let telegram = FakeTelegram {
            failing_chats: vec![2],
            ..Default::default()
        };
        let batch = vec![recipient(1), recipient(2), recipient(3)];

        let deliveries = send_batch(&telegram, "hi", &batch, Duration::ZERO).await;

        let statuses: Vec<_> = deliveries.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![DeliveryStatus::Sent, DeliveryStatus::Failed, DeliveryStatus::Sent]
        );
        assert!(deliveries[1].error.is_some());
        assert_eq!(telegram.calls().len(), 3);
    }

    #[test]
    fn resume_skips_users_already_reached() {
        let done = recipient(1);
        let left = recipient(2);
        let reached = HashSet::from([done.user_id]);

        assert_eq!(not_yet_reached(vec![done, left], &reached), vec![left]);
    }

    #[test]
    fn only_drafts_can_start() {
        let mut broadcast = Broadcast {
            id: Uuid::new_v4(),
            text: "hi".to_string(),
            filter: sqlx::types::Json(BroadcastFilter::All),
            status: BroadcastStatus::Draft,
            sent_count: 0,
            failed_count: 0,
            created_by: 42,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(ensure_draft(&broadcast).is_ok());

        broadcast.status = BroadcastStatus::Sending;
        assert!(matches!(
            ensure_draft(&broadcast),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let telegram = FakeTelegram {
            failing_chats: vec![5],
            ..Default::default()
        };
        assert!(send_with_retry(&telegram, 5, "hi").await.is_err());
        assert_eq!(
            telegram.calls(),
            vec![Call::Message {
                chat_id: 5,
                text: "hi".to_string()
            }]
        );
    }
}
