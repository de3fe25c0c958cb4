//! Data models representing database entities.
//!
//! This module contains all data structures that map to database tables,
//! plus the request/response bodies of the REST API.

/// Admin allow-list
pub mod admin;
/// Broadcasts and per-recipient delivery records
pub mod broadcast;
/// Demo (trial) access
pub mod demo;
/// Discounts and promo codes
pub mod marketing;
/// Payments and the payment status lifecycle
pub mod payment;
/// Products and gated channels
pub mod product;
/// Subscriptions and the subscription status lifecycle
pub mod subscription;
/// Mini App users
pub mod user;

/// A status column held a value the Rust enum does not know.
///
/// Raised while decoding rows; the `CHECK` constraints in the migrations
/// keep this from happening against a migrated database.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
