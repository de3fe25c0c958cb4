//! Telegram Bot API client.
//!
//! Only the handful of methods the shop needs: messaging users, minting
//! one-time invite links, and kicking users out of gated channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The Bot API answered `ok: false`.
    #[error("Bot API error {code}: {description}")]
    Api {
        code: i32,
        description: String,
        /// Seconds to wait when rate limited (HTTP 429).
        retry_after: Option<u64>,
    },
}

impl TelegramError {
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TelegramError::Api { retry_after, .. } => *retry_after,
            TelegramError::Http(_) => None,
        }
    }
}

/// Operations on the Telegram Bot API.
///
/// Chat ids are raw Telegram ids: a user id for private chats, a negative
/// `-100...` id for channels.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    /// Send an HTML-formatted message.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;

    /// Create an invite link usable by a single member until `expire_at`.
    async fn create_invite_link(
        &self,
        chat_id: i64,
        name: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<String, TelegramError>;

    async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> Result<(), TelegramError>;

    /// Lift a ban. With `only_if_banned` a current member is left untouched.
    async fn unban_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
        only_if_banned: bool,
    ) -> Result<(), TelegramError>;
}

/// `reqwest` implementation of [`TelegramApi`].
#[derive(Clone)]
pub struct BotApiClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i32>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Serialize)]
struct CreateChatInviteLink<'a> {
    chat_id: i64,
    name: &'a str,
    expire_date: i64,
    member_limit: u32,
}

#[derive(Serialize)]
struct BanChatMember {
    chat_id: i64,
    user_id: i64,
}

#[derive(Serialize)]
struct UnbanChatMember {
    chat_id: i64,
    user_id: i64,
    only_if_banned: bool,
}

impl BotApiClient {
    pub fn new(bot_token: &str) -> Result<Self, TelegramError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
        })
    }

    async fn call<P: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &P,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(payload)
            .send()
            .await?
            .json()
            .await?;

        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api {
                code: response.error_code.unwrap_or_default(),
                description: response
                    .description
                    .unwrap_or_else(|| format!("{method} returned no result")),
                retry_after: response.parameters.and_then(|p| p.retry_after),
            }),
        }
    }
}

#[async_trait]
impl TelegramApi for BotApiClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let payload = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        self.call::<_, serde_json::Value>("sendMessage", &payload)
            .await
            .map(|_| ())
    }

    async fn create_invite_link(
        &self,
        chat_id: i64,
        name: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<String, TelegramError> {
        let payload = CreateChatInviteLink {
            chat_id,
            name,
            expire_date: expire_at.timestamp(),
            member_limit: 1,
        };
        let link: ChatInviteLink = self.call("createChatInviteLink", &payload).await?;
        Ok(link.invite_link)
    }

    async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> Result<(), TelegramError> {
        self.call::<_, bool>("banChatMember", &BanChatMember { chat_id, user_id })
            .await
            .map(|_| ())
    }

    async fn unban_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
        only_if_banned: bool,
    ) -> Result<(), TelegramError> {
        let payload = UnbanChatMember {
            chat_id,
            user_id,
            only_if_banned,
        };
        self.call::<_, bool>("unbanChatMember", &payload)
            .await
            .map(|_| ())
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Bot API call recorded by [`FakeTelegram`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Message { chat_id: i64, text: String },
        InviteLink { chat_id: i64 },
        Ban { chat_id: i64, user_id: i64 },
        Unban { chat_id: i64, user_id: i64, only_if_banned: bool },
    }

    /// In-memory Telegram that records calls; chats in `failing_chats` error.
    #[derive(Default)]
    pub(crate) struct FakeTelegram {
        pub calls: Mutex<Vec<Call>>,
        pub failing_chats: Vec<i64>,
    }

    impl FakeTelegram {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call, chat_id: i64) -> Result<(), TelegramError> {
            self.calls.lock().unwrap().push(call);
            if self.failing_chats.contains(&chat_id) {
                return Err(TelegramError::Api {
                    code: 400,
                    description: "Bad Request: chat not found".to_string(),
                    retry_after: None,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TelegramApi for FakeTelegram {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
            self.record(
                Call::Message {
                    chat_id,
                    text: text.to_string(),
                },
                chat_id,
            )
        }

        async fn create_invite_link(
            &self,
            chat_id: i64,
            _name: &str,
            _expire_at: DateTime<Utc>,
        ) -> Result<String, TelegramError> {
            self.record(Call::InviteLink { chat_id }, chat_id)?;
            Ok(format!("https://t.me/+invite{}", chat_id.unsigned_abs()))
        }

        async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> Result<(), TelegramError> {
            self.record(Call::Ban { chat_id, user_id }, chat_id)
        }

        async fn unban_chat_member(
            &self,
            chat_id: i64,
            user_id: i64,
            only_if_banned: bool,
        ) -> Result<(), TelegramError> {
            self.record(
                Call::Unban {
                    chat_id,
                    user_id,
                    only_if_banned,
                },
                chat_id,
            )
        }
    }

    #[test]
    fn escapes_html_special_characters() {
        assert_eq!(escape_html("<b>Tom & Jerry</b>"), "&lt;b&gt;Tom &amp; Jerry&lt;/b&gt;");
    }

    #[test]
    fn api_error_envelope_keeps_retry_after() {
        let raw = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 3","parameters":{"retry_after":3}}"#;
        let response: ApiResponse<bool> = serde_json::from_str(raw).unwrap();
        assert!(!response.ok);
        assert_eq!(response.parameters.and_then(|p| p.retry_after), Some(3));
    }
}
