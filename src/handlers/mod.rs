//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, auth extension)
//! 2. Delegates to a service
//! 3. Returns HTTP response (JSON, status code)

/// Admin: broadcasts and admin roster
pub mod admin_broadcasts;
/// Admin: products, channels, discounts, promo codes
pub mod admin_catalog;
/// Admin: payments, subscriptions, stats
pub mod admin_sales;
/// Health check endpoint
pub mod health;
/// Caller profile and subscriptions
pub mod me;
/// User payment endpoints
pub mod payments;
/// Catalogue, promo validation and demos
pub mod products;
/// Inbound NOWPayments IPN
pub mod webhooks;
