//! Catalogue endpoints for Mini App users.
//!
//! - GET  /api/products             - Active products with their channels
//! - GET  /api/products/{id}        - One active product
//! - POST /api/products/{id}/demo   - Start the free demo
//! - POST /api/promo/validate       - Price a product with a promo code

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::marketing::ValidatePromoRequest;
use crate::models::product::ProductResponse;
use crate::services::pricing::Quote;
use crate::services::{catalog_service, demo_service, payment_service};
use crate::state::AppState;

pub async fn list_products(
    State(pool): State<DbPool>,
) -> Result<Json<Vec<ProductResponse>>, AppError> {
    Ok(Json(catalog_service::list_products(&pool, true).await?))
}

/// Inactive products answer 404, same as unknown ids.
pub async fn get_product(
    State(pool): State<DbPool>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductResponse>, AppError> {
    Ok(Json(catalog_service::get_product(&pool, product_id, true).await?))
}

/// Price a product with a promo code before paying.
///
/// # Request Body
///
/// ```json
/// { "code": "SPRING25", "product_id": "550e8400-e29b-41d4-a716-446655440000" }
/// ```
///
/// # Response
///
/// - **200 OK**: the resulting quote
/// - **400**: unknown, expired, exhausted or out-of-scope code
pub async fn validate_promo(
    State(pool): State<DbPool>,
    Json(request): Json<ValidatePromoRequest>,
) -> Result<Json<Quote>, AppError> {
    let product = payment_service::find_active_product(&pool, request.product_id).await?;
    let quote = payment_service::quote_product(&pool, &product, Some(&request.code)).await?;
    Ok(Json(quote))
}

/// Start the one free demo a user gets per product.
///
/// # Response
///
/// - **201 Created**: demo access; invite links arrive in the bot chat
/// - **400**: product has no demo
/// - **409**: already claimed or already subscribed
pub async fn claim_demo(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let demo = demo_service::claim_demo(&state, &auth.user, product_id).await?;
    Ok((StatusCode::CREATED, Json(demo)))
}
