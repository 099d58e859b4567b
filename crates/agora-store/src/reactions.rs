//! Reaction ledger.
//!
//! Reactions are additive: a `(message, user, emoji)` triple exists at most
//! once, and concurrent writers merge by set union.  Adding an existing
//! triple is a no-op, never a toggle.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};

use agora_shared::types::{ConversationId, MessageId, UserId};

use crate::codec::{self, encode_ts, parse_uuid};
use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Add `emoji` from `user` to a message.  Returns `true` if the reaction
    /// was not already present.
    pub fn add_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<bool> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(StoreError::Validation("emoji cannot be empty".to_string()));
        }
        ensure_message(self.conn(), conversation_id, message_id)?;

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                user.as_str(),
                emoji,
                encode_ts(&codec::now()),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove one `(user, emoji)` pair.  Returns `true` if a row was deleted.
    pub fn remove_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<bool> {
        ensure_message(self.conn(), conversation_id, message_id)?;

        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.to_string(), user.as_str(), emoji.trim()],
        )?;
        Ok(affected > 0)
    }

    /// emoji -> users for one message, ordered by each emoji's first use.
    pub fn get_reactions(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<IndexMap<String, BTreeSet<UserId>>> {
        ensure_message(self.conn(), conversation_id, message_id)?;
        reactions_for_message(self.conn(), message_id)
    }
}

pub(crate) fn ensure_message(
    conn: &Connection,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<()> {
    conn.query_row(
        "SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2",
        params![message_id.to_string(), conversation_id.to_string()],
        |_| Ok(()),
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))
}

pub(crate) fn reactions_for_message(
    conn: &Connection,
    message_id: MessageId,
) -> Result<IndexMap<String, BTreeSet<UserId>>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, emoji FROM reactions WHERE message_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut map: IndexMap<String, BTreeSet<UserId>> = IndexMap::new();
    for row in rows {
        let (user, emoji) = row?;
        map.entry(emoji).or_default().insert(UserId(user));
    }
    Ok(map)
}

pub(crate) fn reactions_for_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<HashMap<MessageId, IndexMap<String, BTreeSet<UserId>>>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.emoji
         FROM reactions r
         JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = ?1
         ORDER BY r.seq ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
        let message_id: String = row.get(0)?;
        Ok((
            MessageId(parse_uuid(0, &message_id)?),
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut map: HashMap<MessageId, IndexMap<String, BTreeSet<UserId>>> = HashMap::new();
    for row in rows {
        let (message_id, user, emoji) = row?;
        map.entry(message_id)
            .or_default()
            .entry(emoji)
            .or_default()
            .insert(UserId(user));
    }
    Ok(map)
}
