//! Business logic services.
//!
//! Services contain the core logic separated from HTTP handlers: pricing,
//! payment settlement, channel access, background monitors and the clients
//! for Telegram, NOWPayments and Toncenter.

pub mod broadcast_service;
pub mod catalog_service;
pub mod channel_access;
pub mod demo_service;
pub mod expiry;
pub mod nowpayments;
pub mod payment_service;
pub mod pricing;
pub mod reconciler;
pub mod subscription_service;
pub mod telegram;
pub mod ton_explorer;
pub mod ton_monitor;
pub mod user_service;
