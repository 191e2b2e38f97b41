#![deny(missing_docs)]
//! Order relay core library.
//!
//! Session lifecycle management, connection health monitoring, and the
//! message filtering/forwarding pipeline for a Telegram-style transport.
//! The transport binding itself and the admin control surface are external
//! collaborators consumed through the traits defined here.

/// Configuration management.
pub mod config;
/// Deduplication store for processed messages.
pub mod dedup;
/// Connection factory and authorization probing.
pub mod factory;
/// Keyword exclusion and order-amount filtering.
pub mod filter;
/// Session lifecycle manager and health monitor.
pub mod manager;
/// Per-message processing pipeline.
pub mod pipeline;
/// Persistent session credential store.
pub mod session_store;
/// Transport boundary traits and types.
pub mod transport;
