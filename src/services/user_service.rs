//! Users (from Telegram init data) and the admin roster.

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::middleware::auth::TelegramUser;
use crate::models::admin::Admin;
use crate::models::user::User;

/// Insert the user on first sight; refresh profile fields and `last_seen_at` after.
pub async fn upsert_user(pool: &DbPool, tg: &TelegramUser) -> Result<User, AppError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (telegram_id, username, first_name, language_code)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (telegram_id) DO UPDATE
        SET username = EXCLUDED.username,
            first_name = EXCLUDED.first_name,
            language_code = EXCLUDED.language_code,
            last_seen_at = NOW()
        RETURNING *
        "#,
    )
    .bind(tg.id)
    .bind(&tg.username)
    .bind(&tg.first_name)
    .bind(&tg.language_code)
    .fetch_one(pool)
    .await?;
    Ok(user)
}

/// Bootstrap admins from config, plus whoever they added.
pub async fn is_admin(pool: &DbPool, config: &Config, telegram_id: i64) -> Result<bool, AppError> {
    if config.is_admin(telegram_id) {
        return Ok(true);
    }
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM admins WHERE telegram_id = $1)")
            .bind(telegram_id)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

pub async fn list_admins(pool: &DbPool) -> Result<Vec<Admin>, AppError> {
    let admins = sqlx::query_as::<_, Admin>("SELECT * FROM admins ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(admins)
}

pub async fn add_admin(pool: &DbPool, telegram_id: i64, added_by: i64) -> Result<Admin, AppError> {
    let result = sqlx::query_as::<_, Admin>(
        "INSERT INTO admins (telegram_id, added_by) VALUES ($1, $2) RETURNING *",
    )
    .bind(telegram_id)
    .bind(added_by)
    .fetch_one(pool)
    .await;

    match result {
        Ok(admin) => {
            tracing::info!(telegram_id, added_by, "admin added");
            Ok(admin)
        }
        Err(e) if db::is_unique_violation(&e) => {
            Err(AppError::Conflict("User is already an admin".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove an admin added at runtime. Bootstrap admins cannot be removed here.
pub async fn remove_admin(pool: &DbPool, config: &Config, telegram_id: i64) -> Result<(), AppError> {
    if config.is_admin(telegram_id) {
        return Err(AppError::InvalidRequest(
            "Admins from ADMIN_IDS can only be removed in configuration".to_string(),
        ));
    }
    let removed = sqlx::query("DELETE FROM admins WHERE telegram_id = $1")
        .bind(telegram_id)
        .execute(pool)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(AppError::NotFound("Admin"));
    }
    tracing::info!(telegram_id, "admin removed");
    Ok(())
}
