//! # agora-store
//!
//! Client-local storage for Agora, backed by SQLite.
//!
//! This is the "local storage" of the chat client: unread counters,
//! last-known message counts, emoji usage frequency and avatars that could
//! not be uploaded.  The crate exposes a synchronous `Database` handle that
//! wraps a `rusqlite::Connection` and provides typed helpers for each of
//! these records.  It is best-effort state and never a sync source of truth.

pub mod blobs;
pub mod counters;
pub mod database;
pub mod emoji;
pub mod kv;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
