//! PIN hashing for chat locks and group join gates.
//!
//! PINs are never stored in clear. Each one is hashed with BLAKE3 in
//! derive-key mode, bound to the record it protects, and compared in
//! constant time.

use subtle::ConstantTimeEq;

use crate::constants::{KDF_CONTEXT_CHAT_LOCK, KDF_CONTEXT_GROUP_PIN};

/// What a PIN protects. The scope is mixed into the hash so a chat-lock hash
/// cannot be replayed as a group PIN or for another conversation.
#[derive(Debug, Clone, Copy)]
pub enum PinScope<'a> {
    /// Per-viewer lock on a direct conversation.
    ChatLock {
        conversation: &'a [u8],
        viewer: &'a str,
    },
    /// Shared join PIN of a group.
    GroupJoin { group: &'a [u8] },
}

/// Hash `pin` for storage. Returns a hex string.
pub fn hash_pin(scope: PinScope<'_>, pin: &str) -> String {
    let mut hasher = match scope {
        PinScope::ChatLock {
            conversation,
            viewer,
        } => {
            let mut h = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHAT_LOCK);
            h.update(conversation);
            h.update(viewer.as_bytes());
            h
        }
        PinScope::GroupJoin { group } => {
            let mut h = blake3::Hasher::new_derive_key(KDF_CONTEXT_GROUP_PIN);
            h.update(group);
            h
        }
    };
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Check `attempt` against a stored hash.
pub fn verify_pin(scope: PinScope<'_>, stored_hash: &str, attempt: &str) -> bool {
    let computed = hash_pin(scope, attempt);
    let a = computed.as_bytes();
    let b = stored_hash.as_bytes();
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_pin() {
        let scope = PinScope::GroupJoin { group: b"g1" };
        let stored = hash_pin(scope, "1234");
        assert!(verify_pin(scope, &stored, "1234"));
        assert!(!verify_pin(scope, &stored, "4321"));
    }

    #[test]
    fn scopes_are_separated() {
        let lock = PinScope::ChatLock {
            conversation: b"c1",
            viewer: "alice",
        };
        let other_viewer = PinScope::ChatLock {
            conversation: b"c1",
            viewer: "bob",
        };
        let group = PinScope::GroupJoin { group: b"c1" };

        let stored = hash_pin(lock, "0000");
        assert!(!verify_pin(other_viewer, &stored, "0000"));
        assert!(!verify_pin(group, &stored, "0000"));
    }

    #[test]
    fn hash_is_hex_encoded() {
        let stored = hash_pin(PinScope::GroupJoin { group: b"g" }, "9");
        assert_eq!(stored.len(), 64);
        assert!(hex::decode(&stored).is_ok());
    }
}
