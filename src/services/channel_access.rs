//! Channel access synchronizer.
//!
//! Turns subscription status changes into Telegram side effects: one-time
//! invite links on activation, a kick (ban + unban) on expiry or revocation,
//! and a message to the user either way.
//!
//! Side effects run after the database commit and never roll it back. A
//! failing channel is logged and skipped so one misconfigured chat cannot
//! block access to the others.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::product::Channel;
use crate::services::telegram::{TelegramApi, escape_html};
use uuid::Uuid;

/// Why access is being granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReason {
    Purchase,
    /// Already a member; only the new end date is announced.
    Renewal,
    Demo,
}

/// Why access is being taken away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    Expired,
    Revoked,
    DemoEnded,
}

/// Result of syncing one user against a product's channels.
#[derive(Debug, Default)]
pub struct AccessReport {
    /// (channel title, invite link) for grants
    pub links: Vec<(String, String)>,
    /// Chat ids where the Bot API call failed
    pub failed_chats: Vec<i64>,
    pub notified: bool,
}

#[derive(Clone)]
pub struct ChannelAccess {
    telegram: Arc<dyn TelegramApi>,
    invite_ttl: Duration,
}

impl ChannelAccess {
    pub fn new(telegram: Arc<dyn TelegramApi>, invite_ttl_hours: i64) -> Self {
        Self {
            telegram,
            invite_ttl: Duration::hours(invite_ttl_hours),
        }
    }

    pub fn telegram(&self) -> &Arc<dyn TelegramApi> {
        &self.telegram
    }

    /// Load the product's channels and grant access to all of them.
    pub async fn grant(
        &self,
        pool: &DbPool,
        telegram_user_id: i64,
        product_id: Uuid,
        ends_at: DateTime<Utc>,
        reason: GrantReason,
    ) -> Result<AccessReport, AppError> {
        let (product_name, channels) = load_product_channels(pool, product_id).await?;
        Ok(self
            .grant_channels(telegram_user_id, &product_name, ends_at, &channels, reason)
            .await)
    }

    /// Load the product's channels and remove the user from all of them.
    pub async fn revoke(
        &self,
        pool: &DbPool,
        telegram_user_id: i64,
        product_id: Uuid,
        reason: RevokeReason,
    ) -> Result<AccessReport, AppError> {
        let (product_name, channels) = load_product_channels(pool, product_id).await?;
        Ok(self
            .revoke_channels(telegram_user_id, &product_name, &channels, reason)
            .await)
    }

    pub async fn grant_channels(
        &self,
        telegram_user_id: i64,
        product_name: &str,
        ends_at: DateTime<Utc>,
        channels: &[Channel],
        reason: GrantReason,
    ) -> AccessReport {
        let mut report = AccessReport::default();
        let link_expiry = Utc::now() + self.invite_ttl;
        let channels = if reason == GrantReason::Renewal {
            &[][..]
        } else {
            channels
        };

        for channel in channels {
            // A previous expiry left the user banned-then-unbanned, but an
            // admin may have banned them by hand since.
            if let Err(e) = self
                .telegram
                .unban_chat_member(channel.telegram_chat_id, telegram_user_id, true)
                .await
            {
                tracing::warn!(chat_id = channel.telegram_chat_id, error = %e, "unban before invite failed");
            }

            let link_name = format!("user {telegram_user_id}");
            match self
                .telegram
                .create_invite_link(channel.telegram_chat_id, &link_name, link_expiry)
                .await
            {
                Ok(link) => report.links.push((channel.title.clone(), link)),
                Err(e) => {
                    tracing::error!(
                        chat_id = channel.telegram_chat_id,
                        telegram_user_id,
                        error = %e,
                        "failed to create invite link"
                    );
                    report.failed_chats.push(channel.telegram_chat_id);
                }
            }
        }

        let text = grant_message(product_name, ends_at, &report.links, reason);
        report.notified = self.notify(telegram_user_id, &text).await;
        report
    }

    pub async fn revoke_channels(
        &self,
        telegram_user_id: i64,
        product_name: &str,
        channels: &[Channel],
        reason: RevokeReason,
    ) -> AccessReport {
        let mut report = AccessReport::default();

        for channel in channels {
            let chat_id = channel.telegram_chat_id;
            // Ban removes the member; the unban right after lets them rejoin
            // through a fresh invite link when they pay again.
            let kicked = match self.telegram.ban_chat_member(chat_id, telegram_user_id).await {
                Ok(()) => self
                    .telegram
                    .unban_chat_member(chat_id, telegram_user_id, true)
                    .await,
                Err(e) => Err(e),
            };
            if let Err(e) = kicked {
                tracing::error!(chat_id, telegram_user_id, error = %e, "failed to remove user from channel");
                report.failed_chats.push(chat_id);
            }
        }

        let text = revoke_message(product_name, reason);
        report.notified = self.notify(telegram_user_id, &text).await;
        report
    }

    /// Send a message, logging instead of failing. Returns whether it was delivered.
    pub async fn notify(&self, telegram_user_id: i64, text: &str) -> bool {
        match self.telegram.send_message(telegram_user_id, text).await {
            Ok(()) => true,
            Err(e) => {
                // Users who never started the bot cannot be messaged.
                tracing::warn!(telegram_user_id, error = %e, "failed to notify user");
                false
            }
        }
    }
}

pub(crate) async fn load_product_channels(
    pool: &DbPool,
    product_id: Uuid,
) -> Result<(String, Vec<Channel>), AppError> {
    let product_name: String = sqlx::query_scalar("SELECT name FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Product"))?;

    let channels = sqlx::query_as::<_, Channel>(
        r#"
        SELECT c.id, c.telegram_chat_id, c.title, c.created_at
        FROM channels c
        JOIN product_channels pc ON pc.channel_id = c.id
        WHERE pc.product_id = $1
        ORDER BY c.title
        "#,
    )
    .bind(product_id)
    .fetch_all(pool)
    .await?;

    Ok((product_name, channels))
}

fn grant_message(
    product_name: &str,
    ends_at: DateTime<Utc>,
    links: &[(String, String)],
    reason: GrantReason,
) -> String {
    let headline = match reason {
        GrantReason::Purchase => format!(
            "✅ Payment received! Your subscription to <b>{}</b> is active until {}.",
            escape_html(product_name),
            ends_at.format("%Y-%m-%d %H:%M UTC")
        ),
        GrantReason::Renewal => format!(
            "🔁 Payment received! Your subscription to <b>{}</b> is extended until {}.",
            escape_html(product_name),
            ends_at.format("%Y-%m-%d %H:%M UTC")
        ),
        GrantReason::Demo => format!(
            "🎁 Your demo of <b>{}</b> is active until {}.",
            escape_html(product_name),
            ends_at.format("%Y-%m-%d %H:%M UTC")
        ),
    };

    if links.is_empty() {
        return headline;
    }

    let mut text = headline;
    text.push_str("\n\nJoin your channels (each link works once):");
    for (title, link) in links {
        text.push_str(&format!("\n• <a href=\"{}\">{}</a>", link, escape_html(title)));
    }
    text
}

fn revoke_message(product_name: &str, reason: RevokeReason) -> String {
    let name = escape_html(product_name);
    match reason {
        RevokeReason::Expired => format!(
            "⌛ Your subscription to <b>{name}</b> has expired. Renew it in the app to regain access."
        ),
        RevokeReason::Revoked => {
            format!("🚫 Your access to <b>{name}</b> has been revoked by an administrator.")
        }
        RevokeReason::DemoEnded => format!(
            "⌛ Your demo of <b>{name}</b> has ended. Subscribe in the app to keep access."
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::telegram::tests::{Call, FakeTelegram};

    pub(crate) fn channel(chat_id: i64, title: &str) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            telegram_chat_id: chat_id,
            title: title.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn grant_invites_to_every_channel_and_sends_one_message() {
        let fake = Arc::new(FakeTelegram::default());
        let access = ChannelAccess::new(fake.clone(), 24);
        let channels = vec![channel(-1001, "Signals"), channel(-1002, "Chat")];

        let report = access
            .grant_channels(77, "VIP", Utc::now(), &channels, GrantReason::Purchase)
            .await;

        assert_eq!(report.links.len(), 2);
        assert!(report.failed_chats.is_empty());
        assert!(report.notified);

        let calls = fake.calls();
        assert!(calls.contains(&Call::InviteLink { chat_id: -1001 }));
        assert!(calls.contains(&Call::InviteLink { chat_id: -1002 }));
        let messages: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::Message { chat_id: 77, .. }))
            .collect();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_the_rest() {
        let fake = Arc::new(FakeTelegram {
            failing_chats: vec![-1001],
            ..Default::default()
        });
        let access = ChannelAccess::new(fake.clone(), 24);
        let channels = vec![channel(-1001, "Broken"), channel(-1002, "Works")];

        let report = access
            .grant_channels(77, "VIP", Utc::now(), &channels, GrantReason::Purchase)
            .await;

        assert_eq!(report.failed_chats, vec![-1001]);
        assert_eq!(report.links.len(), 1);
        assert_eq!(report.links[0].0, "Works");
        assert!(report.notified);
    }

    #[tokio::test]
    async fn renewal_only_announces_the_new_end_date() {
        let fake = Arc::new(FakeTelegram::default());
        let access = ChannelAccess::new(fake.clone(), 24);
        let channels = vec![channel(-1001, "Signals")];

        let report = access
            .grant_channels(77, "VIP", Utc::now(), &channels, GrantReason::Renewal)
            .await;

        assert!(report.links.is_empty());
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Message { text, .. } if text.contains("extended")));
    }

    #[tokio::test]
    async fn revoke_kicks_without_permanent_ban() {
        let fake = Arc::new(FakeTelegram::default());
        let access = ChannelAccess::new(fake.clone(), 24);
        let channels = vec![channel(-1001, "Signals")];

        let report = access
            .revoke_channels(77, "VIP", &channels, RevokeReason::Expired)
            .await;

        assert!(report.failed_chats.is_empty());
        let calls = fake.calls();
        assert_eq!(
            &calls[..2],
            &[
                Call::Ban {
                    chat_id: -1001,
                    user_id: 77
                },
                Call::Unban {
                    chat_id: -1001,
                    user_id: 77,
                    only_if_banned: true
                },
            ]
        );
        assert!(matches!(&calls[2], Call::Message { chat_id: 77, text } if text.contains("expired")));
    }

    #[test]
    fn grant_message_escapes_titles() {
        let text = grant_message(
            "A&B",
            Utc::now(),
            &[("<Main>".to_string(), "https://t.me/+x".to_string())],
            GrantReason::Demo,
        );
        assert!(text.contains("A&amp;B"));
        assert!(text.contains("&lt;Main&gt;"));
        assert!(text.contains("demo"));
    }
}
