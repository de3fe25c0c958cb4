//! Telegram Mini App authentication middleware.
//!
//! The Mini App sends the raw `initData` string Telegram handed it:
//!
//! ```text
//! Authorization: tma query_id=...&user=%7B%22id%22%3A...%7D&auth_date=...&hash=...
//! ```
//!
//! `telegram_auth` verifies the signature, upserts the user and injects an
//! [`AuthUser`] for handlers. `admin_auth` runs after it on admin routes and
//! rejects anyone not in `ADMIN_IDS` or the `admins` table with 403.
//!
//! # Signature
//!
//! 1. `data_check_string`: every field except `hash`, URL-decoded, as
//!    `key=value`, sorted by key, joined with `\n`
//! 2. `secret_key = HMAC_SHA256(key = "WebAppData", msg = bot_token)`
//! 3. `hash == hex(HMAC_SHA256(key = secret_key, msg = data_check_string))`

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::error::AppError;
use crate::models::user::User;
use crate::services::user_service;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Scheme prefix of the `Authorization` header.
const SCHEME: &str = "tma ";

/// The `user` field of init data.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

/// Authenticated caller, available to handlers as `Extension<AuthUser>`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
}

fn parse_pairs(init_data: &str) -> Result<BTreeMap<String, String>, AppError> {
    init_data
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or(AppError::Unauthorized)?;
            let value = urlencoding::decode(value).map_err(|_| AppError::Unauthorized)?;
            Ok((key.to_string(), value.into_owned()))
        })
        .collect()
}

fn parse_user(fields: &BTreeMap<String, String>) -> Result<TelegramUser, AppError> {
    let raw = fields.get("user").ok_or(AppError::Unauthorized)?;
    serde_json::from_str(raw).map_err(|_| AppError::Unauthorized)
}

/// Verify init data and return the Telegram user it vouches for.
///
/// `now` is a Unix timestamp; init data older than `max_age_secs` is refused.
pub fn validate_init_data(
    init_data: &str,
    bot_token: &str,
    max_age_secs: i64,
    now: i64,
) -> Result<TelegramUser, AppError> {
    let mut fields = parse_pairs(init_data)?;
    let hash = fields.remove("hash").ok_or(AppError::Unauthorized)?;
    let expected = hex::decode(&hash).map_err(|_| AppError::Unauthorized)?;

    // BTreeMap iterates in key order.
    let data_check_string = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut mac = HmacSha256::new_from_slice(&secret_key(bot_token)?)
        .map_err(|_| AppError::Unauthorized)?;
    mac.update(data_check_string.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| AppError::Unauthorized)?;

    let auth_date: i64 = fields
        .get("auth_date")
        .and_then(|d| d.parse().ok())
        .ok_or(AppError::Unauthorized)?;
    if now - auth_date > max_age_secs {
        tracing::debug!(age_secs = now - auth_date, "stale init data");
        return Err(AppError::Unauthorized);
    }

    parse_user(&fields)
}

/// Read the user without checking the signature. Development only.
fn unverified_user(init_data: &str) -> Result<TelegramUser, AppError> {
    parse_user(&parse_pairs(init_data)?)
}

fn secret_key(bot_token: &str) -> Result<Vec<u8>, AppError> {
    let mut mac = HmacSha256::new_from_slice(b"WebAppData").map_err(|_| AppError::Unauthorized)?;
    mac.update(bot_token.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Authenticate a Mini App request.
///
/// # Flow
///
/// 1. Extract `Authorization: tma <initData>`
/// 2. Verify signature and age (skipped when `SKIP_INIT_DATA_VALIDATION`)
/// 3. Upsert the user row
/// 4. Inject [`AuthUser`] and call the next handler
pub async fn telegram_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let init_data = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix(SCHEME))
        .ok_or(AppError::Unauthorized)?;

    let tg_user = if state.config.skip_init_data_validation {
        unverified_user(init_data)?
    } else {
        validate_init_data(
            init_data,
            &state.config.bot_token,
            state.config.init_data_max_age_secs,
            Utc::now().timestamp(),
        )?
    };

    let user = user_service::upsert_user(&state.pool, &tg_user).await?;
    request.extensions_mut().insert(AuthUser { user });

    Ok(next.run(request).await)
}

/// Restrict a route to admins. Must run after [`telegram_auth`].
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let telegram_id = request
        .extensions()
        .get::<AuthUser>()
        .map(|auth| auth.user.telegram_id)
        .ok_or(AppError::Unauthorized)?;

    if !user_service::is_admin(&state.pool, &state.config, telegram_id).await? {
        tracing::warn!(telegram_id, path = %request.uri().path(), "non-admin on admin route");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}
