//! # agora-store
//!
//! Local SQLite storage for the Agora conversation engine.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages,
//! reactions, read receipts, direct conversations, groups, blocks and
//! per-viewer chat locks.  Operations that must be atomic (an append and
//! its `last_message_id` projection, a delete and the recomputed
//! projection) run inside a single transaction.

pub mod blocks;
pub mod conversations;
pub mod database;
pub mod groups;
pub mod locks;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;
pub mod receipts;

mod codec;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
