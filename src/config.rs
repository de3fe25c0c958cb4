//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use serde::Deserialize;

/// A setting that parsed but makes no sense.
#[derive(Debug, thiserror::Error)]
#[error("{var}: {reason}")]
pub struct InvalidSetting {
    pub var: &'static str,
    pub reason: String,
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `BOT_TOKEN` (required): Telegram bot token, also the key for Mini App init data
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `ADMIN_IDS` (optional): comma separated Telegram ids that are always admins
/// - `PUBLIC_BASE_URL` (optional): externally reachable URL, used for the IPN callback
/// - `NOWPAYMENTS_*`, `TON_*`, `TONCENTER_*`, `USDT_JETTON_MASTER`: payment providers
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub bot_token: String,

    #[serde(default)]
    pub admin_ids: Vec<i64>,

    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default)]
    pub nowpayments_api_key: Option<String>,

    #[serde(default)]
    pub nowpayments_ipn_secret: Option<String>,

    #[serde(default = "default_nowpayments_api_url")]
    pub nowpayments_api_url: String,

    /// Wallet that receives TON and owns the USDT jetton wallet.
    #[serde(default)]
    pub ton_wallet_address: Option<String>,

    #[serde(default)]
    pub usdt_jetton_master: Option<String>,

    #[serde(default = "default_toncenter_api_url")]
    pub toncenter_api_url: String,

    #[serde(default)]
    pub toncenter_api_key: Option<String>,

    #[serde(default = "default_ton_poll_interval")]
    pub ton_poll_interval_secs: u64,

    #[serde(default = "default_expiry_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,

    /// How long a pending payment waits for funds before it expires.
    #[serde(default = "default_payment_ttl")]
    pub payment_ttl_minutes: i64,

    #[serde(default = "default_init_data_max_age")]
    pub init_data_max_age_secs: i64,

    #[serde(default = "default_invite_link_ttl")]
    pub invite_link_ttl_hours: i64,

    /// Pause between two broadcast messages (Telegram allows ~30 msg/s).
    #[serde(default = "default_broadcast_delay")]
    pub broadcast_delay_ms: u64,

    /// Development only: accept unsigned init data.
    #[serde(default)]
    pub skip_init_data_validation: bool,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_nowpayments_api_url() -> String {
    "https://api.nowpayments.io/v1".to_string()
}

fn default_toncenter_api_url() -> String {
    "https://toncenter.com/api/v3".to_string()
}

fn default_ton_poll_interval() -> u64 {
    30
}

fn default_expiry_sweep_interval() -> u64 {
    300
}

fn default_payment_ttl() -> i64 {
    60
}

fn default_init_data_max_age() -> i64 {
    86_400
}

fn default_invite_link_ttl() -> i64 {
    24
}

fn default_broadcast_delay() -> u64 {
    50
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL, BOT_TOKEN)
    /// - Environment variable values cannot be parsed into expected types
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    /// Reject settings that would only fail later at runtime.
    ///
    /// Base URLs must be absolute HTTPS (plain HTTP is allowed for localhost)
    /// and intervals must be non-zero.
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        if let Some(base) = &self.public_base_url {
            validate_base_url("PUBLIC_BASE_URL", base)?;
        }
        validate_base_url("NOWPAYMENTS_API_URL", &self.nowpayments_api_url)?;
        validate_base_url("TONCENTER_API_URL", &self.toncenter_api_url)?;

        if self.ton_poll_interval_secs == 0 || self.expiry_sweep_interval_secs == 0 {
            return Err(InvalidSetting {
                var: "TON_POLL_INTERVAL_SECS / EXPIRY_SWEEP_INTERVAL_SECS",
                reason: "must be positive".to_string(),
            });
        }
        if self.payment_ttl_minutes <= 0 {
            return Err(InvalidSetting {
                var: "PAYMENT_TTL_MINUTES",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether the Telegram id is a bootstrap admin from `ADMIN_IDS`.
    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.admin_ids.contains(&telegram_id)
    }

    /// Whether TON / USDT payments can be offered at all.
    pub fn ton_enabled(&self) -> bool {
        self.ton_wallet_address.is_some()
    }

    /// IPN callback the NOWPayments invoice should post to.
    pub fn ipn_callback_url(&self) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{}/api/webhooks/nowpayments", base.trim_end_matches('/')))
    }
}

fn validate_base_url(var: &'static str, value: &str) -> Result<(), InvalidSetting> {
    let invalid = |reason: &str| InvalidSetting {
        var,
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(value).map_err(|_| invalid("not a valid URL"))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" if matches!(parsed.host_str(), Some("localhost" | "127.0.0.1")) => Ok(()),
        "http" => Err(invalid("HTTP is only allowed for localhost")),
        _ => Err(invalid("must use HTTP or HTTPS")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal configuration for unit tests.
    pub(crate) fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_string(),
            server_port: default_port(),
            bot_token: "123456:TEST".to_string(),
            admin_ids: vec![42],
            public_base_url: Some("https://shop.example.com/".to_string()),
            nowpayments_api_key: None,
            nowpayments_ipn_secret: Some("ipn-secret".to_string()),
            nowpayments_api_url: default_nowpayments_api_url(),
            ton_wallet_address: Some("UQWallet".to_string()),
            usdt_jetton_master: Some("EQUsdtMaster".to_string()),
            toncenter_api_url: default_toncenter_api_url(),
            toncenter_api_key: None,
            ton_poll_interval_secs: default_ton_poll_interval(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval(),
            payment_ttl_minutes: default_payment_ttl(),
            init_data_max_age_secs: default_init_data_max_age(),
            invite_link_ttl_hours: default_invite_link_ttl(),
            broadcast_delay_ms: 0,
            skip_init_data_validation: false,
        }
    }

    #[test]
    fn ipn_callback_url_strips_trailing_slash() {
        let config = test_config();
        assert_eq!(
            config.ipn_callback_url().as_deref(),
            Some("https://shop.example.com/api/webhooks/nowpayments")
        );
    }

    #[test]
    fn bootstrap_admins_come_from_env_list() {
        let config = test_config();
        assert!(config.is_admin(42));
        assert!(!config.is_admin(7));
    }

    #[test]
    fn validate_rejects_plain_http_outside_localhost() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.public_base_url = Some("http://localhost:3000".to_string());
        assert!(config.validate().is_ok());

        config.public_base_url = Some("http://shop.example.com".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.var, "PUBLIC_BASE_URL");

        config.public_base_url = Some("shop.example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut config = test_config();
        config.ton_poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
