//! # roomchat-store
//!
//! Backing document store for the roomchat engine, on top of SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users,
//! messages, read receipts, notifications, group channels, and the local
//! session store.
//! Rows that fail validation are rejected when read, never passed inward.

pub mod channels;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod session;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
