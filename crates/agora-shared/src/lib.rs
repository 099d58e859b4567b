//! # agora-shared
//!
//! Types shared by every Agora crate: identifiers, conversation kinds,
//! constants and PIN hashing.

pub mod constants;
pub mod error;
pub mod pin;
pub mod types;
