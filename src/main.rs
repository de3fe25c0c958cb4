//! Telegram subscription shop - Main Application Entry Point
//!
//! Backend for a Telegram Mini App that sells access to gated channels.
//! Users pay with TON, USDT (jetton) or a NOWPayments checkout; once a
//! payment is verified the bot invites them to the product's channels, and
//! removes them again when the subscription runs out.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Authentication**: Telegram WebApp init data (HMAC-SHA256 with the bot token)
//! - **Background tasks**: TON chain monitor, expiry sweeper
//!
//! # Startup Flow
//!
//! 1. Load and validate configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Build the Telegram, NOWPayments and Toncenter clients
//! 4. Resume interrupted broadcasts and spawn the background tasks
//! 5. Serve HTTP until Ctrl-C, then stop the tasks

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod state;

use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tracing_subscriber::EnvFilter;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::services::channel_access::ChannelAccess;
use crate::services::nowpayments::NowPaymentsClient;
use crate::services::telegram::BotApiClient;
use crate::services::ton_explorer::ToncenterClient;
use crate::services::{broadcast_service, expiry, ton_monitor};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info")
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;
    config.validate()?;
    if config.skip_init_data_validation {
        tracing::warn!("SKIP_INIT_DATA_VALIDATION is on; never use this in production");
    }
    tracing::info!(
        ton = config.ton_enabled(),
        nowpayments = config.nowpayments_api_key.is_some(),
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let telegram = Arc::new(BotApiClient::new(&config.bot_token)?);
    let access = ChannelAccess::new(telegram, config.invite_link_ttl_hours);
    let nowpayments =
        NowPaymentsClient::new(&config.nowpayments_api_url, config.nowpayments_api_key.clone())?;
    let explorer = Arc::new(ToncenterClient::new(
        &config.toncenter_api_url,
        config.toncenter_api_key.clone(),
    )?);

    let state = AppState {
        pool,
        config: Arc::new(config),
        access,
        nowpayments,
        explorer,
    };

    match broadcast_service::resume_interrupted(&state).await {
        Ok(0) => {}
        Ok(resumed) => tracing::info!(resumed, "Resumed interrupted broadcasts"),
        Err(e) => tracing::error!(error = %e, "failed to resume interrupted broadcasts"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let monitor = tokio::spawn(ton_monitor::run(state.clone(), shutdown_rx.clone()));
    let sweeper = tokio::spawn(expiry::run(state.clone(), shutdown_rx));

    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks and let an in-flight pass finish.
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(monitor, sweeper);
    tracing::info!("Shutdown complete");

    Ok(())
}

fn router(state: AppState) -> Router {
    // Admin routes: telegram_auth runs first (outer layer), then admin_auth.
    let admin_routes = Router::new()
        .route(
            "/api/admin/products",
            get(handlers::admin_catalog::list_products).post(handlers::admin_catalog::create_product),
        )
        .route(
            "/api/admin/products/{id}",
            get(handlers::admin_catalog::get_product)
                .patch(handlers::admin_catalog::update_product)
                .delete(handlers::admin_catalog::delete_product),
        )
        .route(
            "/api/admin/products/{id}/channels",
            put(handlers::admin_catalog::set_product_channels),
        )
        .route(
            "/api/admin/channels",
            get(handlers::admin_catalog::list_channels).post(handlers::admin_catalog::create_channel),
        )
        .route(
            "/api/admin/channels/{id}",
            delete(handlers::admin_catalog::delete_channel),
        )
        .route(
            "/api/admin/discounts",
            get(handlers::admin_catalog::list_discounts).post(handlers::admin_catalog::create_discount),
        )
        .route(
            "/api/admin/discounts/{id}/active",
            put(handlers::admin_catalog::set_discount_active),
        )
        .route(
            "/api/admin/promo-codes",
            get(handlers::admin_catalog::list_promo_codes)
                .post(handlers::admin_catalog::create_promo_code),
        )
        .route(
            "/api/admin/promo-codes/{id}/active",
            put(handlers::admin_catalog::set_promo_code_active),
        )
        .route("/api/admin/payments", get(handlers::admin_sales::list_payments))
        .route(
            "/api/admin/payments/{id}/confirm",
            post(handlers::admin_sales::confirm_payment),
        )
        .route(
            "/api/admin/payments/{id}/cancel",
            post(handlers::admin_sales::cancel_payment),
        )
        .route(
            "/api/admin/subscriptions",
            get(handlers::admin_sales::list_subscriptions),
        )
        .route(
            "/api/admin/subscriptions/{id}/revoke",
            post(handlers::admin_sales::revoke_subscription),
        )
        .route("/api/admin/stats", get(handlers::admin_sales::stats))
        .route(
            "/api/admin/broadcasts",
            get(handlers::admin_broadcasts::list_broadcasts)
                .post(handlers::admin_broadcasts::create_broadcast),
        )
        .route(
            "/api/admin/broadcasts/{id}",
            get(handlers::admin_broadcasts::get_broadcast),
        )
        .route(
            "/api/admin/broadcasts/{id}/send",
            post(handlers::admin_broadcasts::send_broadcast),
        )
        .route(
            "/api/admin/admins",
            get(handlers::admin_broadcasts::list_admins).post(handlers::admin_broadcasts::add_admin),
        )
        .route(
            "/api/admin/admins/{telegram_id}",
            delete(handlers::admin_broadcasts::remove_admin),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::admin_auth,
        ));

    let user_routes = Router::new()
        .route("/api/me", get(handlers::me::me))
        .route("/api/subscriptions", get(handlers::me::my_subscriptions))
        .route("/api/demos", get(handlers::me::my_demos))
        .route("/api/products", get(handlers::products::list_products))
        .route("/api/products/{id}", get(handlers::products::get_product))
        .route("/api/products/{id}/demo", post(handlers::products::claim_demo))
        .route("/api/promo/validate", post(handlers::products::validate_promo))
        .route(
            "/api/payments",
            get(handlers::payments::list_my_payments).post(handlers::payments::create_payment),
        )
        .route("/api/payments/{id}", get(handlers::payments::get_payment))
        .route(
            "/api/payments/{id}/cancel",
            post(handlers::payments::cancel_payment),
        )
        .merge(admin_routes)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::telegram_auth,
        ));

    // The Mini App is served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Public routes (no authentication required)
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/webhooks/nowpayments",
            post(handlers::webhooks::nowpayments_ipn),
        )
        .merge(user_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
