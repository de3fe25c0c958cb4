//! Products, channels and the marketing rules attached to them.

use std::collections::HashMap;
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::models::marketing::{CreateDiscountRequest, CreatePromoCodeRequest, Discount, PromoCode};
use crate::models::product::{
    Channel, ChannelSummary, CreateChannelRequest, CreateProductRequest, Product, ProductResponse,
    UpdateProductRequest,
};

/// Products with their channels, in display order.
pub async fn list_products(pool: &DbPool, only_active: bool) -> Result<Vec<ProductResponse>, AppError> {
    let products = sqlx::query_as::<_, Product>(
        r#"
        SELECT * FROM products
        WHERE ($1 = FALSE OR is_active = TRUE)
        ORDER BY sort_order, created_at
        "#,
    )
    .bind(only_active)
    .fetch_all(pool)
    .await?;

    let rows = sqlx::query_as::<_, (Uuid, Uuid, String)>(
        r#"
        SELECT pc.product_id, c.id, c.title
        FROM product_channels pc
        JOIN channels c ON c.id = pc.channel_id
        ORDER BY c.title
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut channels: HashMap<Uuid, Vec<ChannelSummary>> = HashMap::new();
    for (product_id, id, title) in rows {
        channels
            .entry(product_id)
            .or_default()
            .push(ChannelSummary { id, title });
    }

    Ok(products
        .into_iter()
        .map(|product| ProductResponse {
            channels: channels.remove(&product.id).unwrap_or_default(),
            product,
        })
        .collect())
}

pub async fn get_product(pool: &DbPool, id: Uuid, only_active: bool) -> Result<ProductResponse, AppError> {
    let product = sqlx::query_as::<_, Product>(
        "SELECT * FROM products WHERE id = $1 AND ($2 = FALSE OR is_active = TRUE)",
    )
    .bind(id)
    .bind(only_active)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Product"))?;

    let channels = product_channels(pool, id).await?;
    Ok(ProductResponse {
        product,
        channels: channels.into_iter().map(ChannelSummary::from).collect(),
    })
}

async fn product_channels(pool: &DbPool, product_id: Uuid) -> Result<Vec<Channel>, AppError> {
    let channels = sqlx::query_as::<_, Channel>(
        r#"
        SELECT c.* FROM channels c
        JOIN product_channels pc ON pc.channel_id = c.id
        WHERE pc.product_id = $1
        ORDER BY c.title
        "#,
    )
    .bind(product_id)
    .fetch_all(pool)
    .await?;
    Ok(channels)
}

pub async fn create_product(pool: &DbPool, request: CreateProductRequest) -> Result<Product, AppError> {
    request.validate()?;
    let product = sqlx::query_as::<_, Product>(
        r#"
        INSERT INTO products (name, description, price_cents, ton_price_nano, duration_days, demo_days, sort_order)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(request.name.trim())
    .bind(&request.description)
    .bind(request.price_cents)
    .bind(request.ton_price_nano)
    .bind(request.duration_days)
    .bind(request.demo_days)
    .bind(request.sort_order)
    .fetch_one(pool)
    .await?;

    tracing::info!(product_id = %product.id, name = %product.name, "product created");
    Ok(product)
}

/// Patch a product. `demo_days: 0` turns the demo off.
pub async fn update_product(
    pool: &DbPool,
    id: Uuid,
    request: UpdateProductRequest,
) -> Result<Product, AppError> {
    request.validate()?;

    let mut product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Product"))?;

    if let Some(name) = request.name {
        product.name = name.trim().to_string();
    }
    if request.description.is_some() {
        product.description = request.description;
    }
    if let Some(price) = request.price_cents {
        product.price_cents = price;
    }
    if let Some(ton) = request.ton_price_nano {
        product.ton_price_nano = ton;
    }
    if let Some(days) = request.duration_days {
        product.duration_days = days;
    }
    if let Some(days) = request.demo_days {
        product.demo_days = (days > 0).then_some(days);
    }
    if let Some(active) = request.is_active {
        product.is_active = active;
    }
    if let Some(order) = request.sort_order {
        product.sort_order = order;
    }

    let product = sqlx::query_as::<_, Product>(
        r#"
        UPDATE products
        SET name = $2, description = $3, price_cents = $4, ton_price_nano = $5,
            duration_days = $6, demo_days = $7, is_active = $8, sort_order = $9,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&product.name)
    .bind(&product.description)
    .bind(product.price_cents)
    .bind(product.ton_price_nano)
    .bind(product.duration_days)
    .bind(product.demo_days)
    .bind(product.is_active)
    .bind(product.sort_order)
    .fetch_one(pool)
    .await?;

    Ok(product)
}

/// Products with payment history are never deleted, only hidden.
pub async fn deactivate_product(pool: &DbPool, id: Uuid) -> Result<(), AppError> {
    let updated = sqlx::query("UPDATE products SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(AppError::NotFound("Product"));
    }
    Ok(())
}

/// Replace the channel set of a product.
pub async fn set_product_channels(
    pool: &DbPool,
    product_id: Uuid,
    channel_ids: &[Uuid],
) -> Result<ProductResponse, AppError> {
    let mut tx = pool.begin().await?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM products WHERE id = $1)")
        .bind(product_id)
        .fetch_one(&mut *tx)
        .await?;
    if !exists {
        return Err(AppError::NotFound("Product"));
    }

    let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels WHERE id = ANY($1)")
        .bind(channel_ids)
        .fetch_one(&mut *tx)
        .await?;
    let mut distinct = channel_ids.to_vec();
    distinct.sort();
    distinct.dedup();
    if known != distinct.len() as i64 {
        return Err(AppError::InvalidRequest("Unknown channel id".to_string()));
    }

    sqlx::query("DELETE FROM product_channels WHERE product_id = $1")
        .bind(product_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO product_channels (product_id, channel_id) SELECT $1, UNNEST($2::UUID[])",
    )
    .bind(product_id)
    .bind(&distinct)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    get_product(pool, product_id, false).await
}

pub async fn list_channels(pool: &DbPool) -> Result<Vec<Channel>, AppError> {
    let channels = sqlx::query_as::<_, Channel>("SELECT * FROM channels ORDER BY title")
        .fetch_all(pool)
        .await?;
    Ok(channels)
}

pub async fn create_channel(pool: &DbPool, request: CreateChannelRequest) -> Result<Channel, AppError> {
    if request.title.trim().is_empty() {
        return Err(AppError::InvalidRequest("Title is required".to_string()));
    }
    let result = sqlx::query_as::<_, Channel>(
        "INSERT INTO channels (telegram_chat_id, title) VALUES ($1, $2) RETURNING *",
    )
    .bind(request.telegram_chat_id)
    .bind(request.title.trim())
    .fetch_one(pool)
    .await;

    match result {
        Ok(channel) => Ok(channel),
        Err(e) if db::is_unique_violation(&e) => {
            Err(AppError::Conflict("Channel already registered".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_channel(pool: &DbPool, id: Uuid) -> Result<(), AppError> {
    let deleted = sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(AppError::NotFound("Channel"));
    }
    Ok(())
}

pub async fn list_discounts(pool: &DbPool) -> Result<Vec<Discount>, AppError> {
    let discounts = sqlx::query_as::<_, Discount>("SELECT * FROM discounts ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(discounts)
}

pub async fn create_discount(pool: &DbPool, request: CreateDiscountRequest) -> Result<Discount, AppError> {
    request.validate()?;
    let discount = sqlx::query_as::<_, Discount>(
        r#"
        INSERT INTO discounts (product_id, percent_off, starts_at, ends_at)
        SELECT id, $2, $3, $4 FROM products WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(request.product_id)
    .bind(request.percent_off)
    .bind(request.starts_at)
    .bind(request.ends_at)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Product"))?;
    Ok(discount)
}

pub async fn set_discount_active(pool: &DbPool, id: Uuid, is_active: bool) -> Result<Discount, AppError> {
    sqlx::query_as::<_, Discount>("UPDATE discounts SET is_active = $2 WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(is_active)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Discount"))
}

pub async fn list_promo_codes(pool: &DbPool) -> Result<Vec<PromoCode>, AppError> {
    let codes = sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(codes)
}

/// Codes are stored upper-case and matched case-insensitively.
pub async fn create_promo_code(
    pool: &DbPool,
    request: CreatePromoCodeRequest,
) -> Result<PromoCode, AppError> {
    request.validate()?;
    let result = sqlx::query_as::<_, PromoCode>(
        r#"
        INSERT INTO promo_codes (code, percent_off, amount_off_cents, product_id, max_uses, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(request.code.trim().to_uppercase())
    .bind(request.percent_off)
    .bind(request.amount_off_cents)
    .bind(request.product_id)
    .bind(request.max_uses)
    .bind(request.expires_at)
    .fetch_one(pool)
    .await;

    match result {
        Ok(code) => Ok(code),
        Err(e) if db::is_unique_violation(&e) => {
            Err(AppError::Conflict("Promo code already exists".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn set_promo_code_active(
    pool: &DbPool,
    id: Uuid,
    is_active: bool,
) -> Result<PromoCode, AppError> {
    sqlx::query_as::<_, PromoCode>("UPDATE promo_codes SET is_active = $2 WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(is_active)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Promo code"))
}
