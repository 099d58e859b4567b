//! CRUD operations for direct conversations.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, Connection, OptionalExtension};

use agora_shared::types::{ConversationId, ConversationKind, MessageId, UserId};

use crate::codec::{self, encode_ts, parse_enum, parse_ts, parse_uuid};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ConversationRecord, DirectConversation, Participant};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the direct conversation between `a` and `b`, creating it if
    /// none exists.  The boolean is `true` when a new row was created.
    ///
    /// Display snapshots are only written on creation; an existing
    /// conversation keeps the names it was created with.
    pub fn find_or_create_direct(
        &mut self,
        a: &Participant,
        b: &Participant,
    ) -> Result<(DirectConversation, bool)> {
        if a.user_id == b.user_id {
            return Err(StoreError::Validation(
                "a direct conversation needs two distinct participants".to_string(),
            ));
        }

        let tx = self.conn_mut().transaction()?;

        if let Some(existing) = find_direct_between(&tx, &a.user_id, &b.user_id)? {
            let conversation = load_direct(&tx, existing)?;
            return Ok((conversation, false));
        }

        let id = ConversationId::new();
        let now = codec::now();
        tx.execute(
            "INSERT INTO conversations (id, kind, last_message_id, created_at)
             VALUES (?1, ?2, NULL, ?3)",
            params![
                id.to_string(),
                ConversationKind::Direct.as_str(),
                encode_ts(&now)
            ],
        )?;
        for participant in [a, b] {
            tx.execute(
                "INSERT INTO direct_participants
                     (conversation_id, user_id, display_name, photo_url, pinned, hidden)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
                params![
                    id.to_string(),
                    participant.user_id.as_str(),
                    participant.display_name,
                    participant.photo_url,
                ],
            )?;
        }

        let conversation = load_direct(&tx, id)?;
        tx.commit()?;

        tracing::info!(conversation = %id, a = %a.user_id, b = %b.user_id, "created direct conversation");
        Ok((conversation, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch the kind-agnostic conversation row.
    pub fn get_conversation_record(&self, id: ConversationId) -> Result<ConversationRecord> {
        self.conn()
            .query_row(
                "SELECT id, kind, last_message_id, created_at FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id_str: String = row.get(0)?;
                    let kind_str: String = row.get(1)?;
                    let last: Option<String> = row.get(2)?;
                    let created_str: String = row.get(3)?;
                    Ok(ConversationRecord {
                        id: ConversationId(parse_uuid(0, &id_str)?),
                        kind: parse_enum(1, &kind_str)?,
                        last_message_id: last
                            .map(|s| parse_uuid(2, &s).map(MessageId))
                            .transpose()?,
                        created_at: parse_ts(3, &created_str)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("conversation {id}")))
    }

    /// Id of the direct conversation between two users, if any.
    pub fn find_direct_between(&self, a: &UserId, b: &UserId) -> Result<Option<ConversationId>> {
        find_direct_between(self.conn(), a, b)
    }

    /// Fetch a direct conversation.  Groups are reported as not found.
    pub fn get_direct_conversation(&self, id: ConversationId) -> Result<DirectConversation> {
        load_direct(self.conn(), id)
    }

    /// Direct conversations `user` takes part in.  Conversations the user
    /// soft-deleted are skipped unless `include_hidden` is set.
    pub fn list_direct_conversations(
        &self,
        user: &UserId,
        include_hidden: bool,
    ) -> Result<Vec<DirectConversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM direct_participants
             WHERE user_id = ?1 AND (hidden = 0 OR ?2)",
        )?;
        let rows = stmt.query_map(params![user.as_str(), include_hidden], |row| {
            let id: String = row.get(0)?;
            Ok(ConversationId(parse_uuid(0, &id)?))
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(load_direct(self.conn(), row?)?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Set `user`'s pin flag.  Other participants are unaffected.
    pub fn set_pinned(&self, id: ConversationId, user: &UserId, pinned: bool) -> Result<()> {
        self.update_participant_flag(id, user, "pinned", pinned)
    }

    /// Set `user`'s soft-delete flag.  Other participants are unaffected.
    pub fn set_hidden(&self, id: ConversationId, user: &UserId, hidden: bool) -> Result<()> {
        self.update_participant_flag(id, user, "hidden", hidden)
    }

    fn update_participant_flag(
        &self,
        id: ConversationId,
        user: &UserId,
        column: &'static str,
        value: bool,
    ) -> Result<()> {
        let affected = self.conn().execute(
            &format!(
                "UPDATE direct_participants SET {column} = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3"
            ),
            params![value, id.to_string(), user.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::not_found(format!(
                "participant {user} in conversation {id}"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation of any kind together with its messages.
    /// Returns `true` if a row was deleted.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fail with `NotFound` unless the conversation exists.  Returns its kind.
pub(crate) fn ensure_conversation(
    conn: &Connection,
    id: ConversationId,
) -> Result<ConversationKind> {
    let kind: String = conn
        .query_row(
            "SELECT kind FROM conversations WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("conversation {id}")))?;
    Ok(parse_enum(0, &kind)?)
}

fn find_direct_between(
    conn: &Connection,
    a: &UserId,
    b: &UserId,
) -> Result<Option<ConversationId>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT p1.conversation_id
             FROM direct_participants p1
             JOIN direct_participants p2 ON p1.conversation_id = p2.conversation_id
             WHERE p1.user_id = ?1 AND p2.user_id = ?2
             LIMIT 1",
            params![a.as_str(), b.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(id
        .map(|s| parse_uuid(0, &s).map(ConversationId))
        .transpose()?)
}

fn load_direct(conn: &Connection, id: ConversationId) -> Result<DirectConversation> {
    let (last, created_str): (Option<String>, String) = conn
        .query_row(
            "SELECT last_message_id, created_at FROM conversations
             WHERE id = ?1 AND kind = 'direct'",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("direct conversation {id}")))?;

    let mut stmt = conn.prepare(
        "SELECT user_id, display_name, photo_url, pinned, hidden
         FROM direct_participants
         WHERE conversation_id = ?1
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |row| {
        Ok((
            Participant {
                user_id: UserId(row.get(0)?),
                display_name: row.get(1)?,
                photo_url: row.get(2)?,
            },
            row.get::<_, bool>(3)?,
            row.get::<_, bool>(4)?,
        ))
    })?;

    let mut participants = Vec::with_capacity(2);
    let mut pinned_by = BTreeMap::new();
    let mut hidden_for = BTreeSet::new();
    for row in rows {
        let (participant, pinned, hidden) = row?;
        pinned_by.insert(participant.user_id.clone(), pinned);
        if hidden {
            hidden_for.insert(participant.user_id.clone());
        }
        participants.push(participant);
    }

    Ok(DirectConversation {
        id,
        participants,
        pinned_by,
        hidden_for,
        last_message_id: last
            .map(|s| parse_uuid(0, &s).map(MessageId))
            .transpose()?,
        created_at: parse_ts(1, &created_str)?,
    })
}
