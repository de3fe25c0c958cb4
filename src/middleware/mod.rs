//! HTTP middleware components.
//!
//! Middleware run before route handlers to authenticate the caller and
//! short-circuit unauthorized requests.

/// Telegram init data and admin authorization
pub mod auth;
