//! # agora-engine
//!
//! Conversation engine for Agora: direct messages and group chat on top of
//! `agora-store`.
//!
//! The crate composes the store with an access guard (membership, blocks,
//! per-viewer chat locks, group PINs), an in-memory presence and typing
//! tracker, and a broadcast event bus. Every public operation lives on
//! [`Engine`] and takes the caller's [`Session`] explicitly.
//!
//! External services (auth, blob storage, push, link previews) are reached
//! through the traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod optimistic;
pub mod presence;
pub mod session;

pub use config::EngineConfig;
pub use engine::{ConversationFeed, ConversationSummary, CreateGroup, Engine};
pub use error::{AccessError, EngineError, Result};
pub use events::{ConversationEvent, Subscription};
pub use guard::AccessState;
pub use session::{CurrentUser, Session};
