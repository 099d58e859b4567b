//! Per-viewer chat locks.
//!
//! A lock belongs to one `(conversation, viewer)` pair and is invisible to
//! the other participant.  Only the PIN hash is stored.

use rusqlite::{params, OptionalExtension};

use agora_shared::types::{ConversationId, UserId};

use crate::conversations::ensure_conversation;
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Set or replace `viewer`'s lock on a conversation.
    pub fn set_chat_lock(
        &self,
        conversation_id: ConversationId,
        viewer: &UserId,
        pin_hash: &str,
    ) -> Result<()> {
        ensure_conversation(self.conn(), conversation_id)?;
        self.conn().execute(
            "INSERT INTO chat_locks (conversation_id, user_id, pin_hash)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (conversation_id, user_id) DO UPDATE SET pin_hash = excluded.pin_hash",
            params![conversation_id.to_string(), viewer.as_str(), pin_hash],
        )?;
        Ok(())
    }

    /// The stored PIN hash, if `viewer` locked this conversation.
    pub fn chat_lock_hash(
        &self,
        conversation_id: ConversationId,
        viewer: &UserId,
    ) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT pin_hash FROM chat_locks WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), viewer.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Remove `viewer`'s lock.  Returns `true` if one existed.
    pub fn remove_chat_lock(&self, conversation_id: ConversationId, viewer: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM chat_locks WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), viewer.as_str()],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Participant;

    #[test]
    fn lock_is_scoped_to_viewer() {
        let mut db = Database::open_in_memory().unwrap();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let (conv, _) = db
            .find_or_create_direct(
                &Participant::new(alice.clone()),
                &Participant::new(bob.clone()),
            )
            .unwrap();

        db.set_chat_lock(conv.id, &alice, "h1").unwrap();
        db.set_chat_lock(conv.id, &alice, "h2").unwrap();

        assert_eq!(db.chat_lock_hash(conv.id, &alice).unwrap().as_deref(), Some("h2"));
        assert_eq!(db.chat_lock_hash(conv.id, &bob).unwrap(), None);

        assert!(db.remove_chat_lock(conv.id, &alice).unwrap());
        assert!(!db.remove_chat_lock(conv.id, &alice).unwrap());
    }
}
