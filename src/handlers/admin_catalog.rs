//! Admin endpoints for the catalogue and marketing rules.
//!
//! All routes here sit behind `telegram_auth` + `admin_auth`.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::marketing::{
    CreateDiscountRequest, CreatePromoCodeRequest, Discount, PromoCode, SetActiveRequest,
};
use crate::models::product::{
    Channel, CreateChannelRequest, CreateProductRequest, Product, ProductResponse,
    SetProductChannelsRequest, UpdateProductRequest,
};
use crate::services::catalog_service;

/// `GET /api/admin/products`, including inactive ones.
pub async fn list_products(
    State(pool): State<DbPool>,
) -> Result<Json<Vec<ProductResponse>>, AppError> {
    Ok(Json(catalog_service::list_products(&pool, false).await?))
}

pub async fn get_product(
    State(pool): State<DbPool>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductResponse>, AppError> {
    Ok(Json(catalog_service::get_product(&pool, product_id, false).await?))
}

/// Create a product.
///
/// # Request Body
///
/// ```json
/// {
///   "name": "VIP Signals",
///   "description": "Daily signals",
///   "price_cents": 1999,
///   "ton_price_nano": 4000000000,
///   "duration_days": 30,
///   "demo_days": 3
/// }
/// ```
pub async fn create_product(
    State(pool): State<DbPool>,
    Json(request): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, AppError> {
    let product = catalog_service::create_product(&pool, request).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn update_product(
    State(pool): State<DbPool>,
    Path(product_id): Path<Uuid>,
    Json(request): Json<UpdateProductRequest>,
) -> Result<Json<Product>, AppError> {
    Ok(Json(catalog_service::update_product(&pool, product_id, request).await?))
}

/// Hides the product; existing subscriptions keep running.
pub async fn delete_product(
    State(pool): State<DbPool>,
    Path(product_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    catalog_service::deactivate_product(&pool, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /api/admin/products/{id}/channels` replaces the channel set.
pub async fn set_product_channels(
    State(pool): State<DbPool>,
    Path(product_id): Path<Uuid>,
    Json(request): Json<SetProductChannelsRequest>,
) -> Result<Json<ProductResponse>, AppError> {
    let product =
        catalog_service::set_product_channels(&pool, product_id, &request.channel_ids).await?;
    Ok(Json(product))
}

pub async fn list_channels(State(pool): State<DbPool>) -> Result<Json<Vec<Channel>>, AppError> {
    Ok(Json(catalog_service::list_channels(&pool).await?))
}

/// Register a channel. The bot must already be an admin there with the
/// "invite users" and "ban users" rights.
pub async fn create_channel(
    State(pool): State<DbPool>,
    Json(request): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, AppError> {
    let channel = catalog_service::create_channel(&pool, request).await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn delete_channel(
    State(pool): State<DbPool>,
    Path(channel_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    catalog_service::delete_channel(&pool, channel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_discounts(State(pool): State<DbPool>) -> Result<Json<Vec<Discount>>, AppError> {
    Ok(Json(catalog_service::list_discounts(&pool).await?))
}

pub async fn create_discount(
    State(pool): State<DbPool>,
    Json(request): Json<CreateDiscountRequest>,
) -> Result<impl IntoResponse, AppError> {
    let discount = catalog_service::create_discount(&pool, request).await?;
    Ok((StatusCode::CREATED, Json(discount)))
}

pub async fn set_discount_active(
    State(pool): State<DbPool>,
    Path(discount_id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> Result<Json<Discount>, AppError> {
    let discount =
        catalog_service::set_discount_active(&pool, discount_id, request.is_active).await?;
    Ok(Json(discount))
}

pub async fn list_promo_codes(State(pool): State<DbPool>) -> Result<Json<Vec<PromoCode>>, AppError> {
    Ok(Json(catalog_service::list_promo_codes(&pool).await?))
}

/// Create a promo code.
///
/// # Request Body
///
/// Exactly one of `percent_off` and `amount_off_cents`:
///
/// ```json
/// { "code": "SPRING25", "percent_off": 25, "max_uses": 100 }
/// ```
pub async fn create_promo_code(
    State(pool): State<DbPool>,
    Json(request): Json<CreatePromoCodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let code = catalog_service::create_promo_code(&pool, request).await?;
    Ok((StatusCode::CREATED, Json(code)))
}

pub async fn set_promo_code_active(
    State(pool): State<DbPool>,
    Path(promo_code_id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> Result<Json<PromoCode>, AppError> {
    let code =
        catalog_service::set_promo_code_active(&pool, promo_code_id, request.is_active).await?;
    Ok(Json(code))
}
