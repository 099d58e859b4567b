//! Message log: append, edit, delete and ordered listing.
//!
//! Every conversation's messages are ordered by `(timestamp, id)`.  Appends
//! clamp the server timestamp to just after the newest message already
//! stored, so a new message always sorts last, and update the
//! conversation's `last_message_id` projection inside the same transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};

use agora_shared::types::{ConversationId, MessageId, MessageKind, UserId};

use crate::codec::{self, encode_ts, parse_enum, parse_ts, parse_uuid};
use crate::conversations::ensure_conversation;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Appended, FileRef, LinkPreview, Message, MessageDraft};
use crate::{reactions, receipts};

const MESSAGE_COLUMNS: &str = "id, conversation_id, creator_id, kind, content, file_url, \
     file_name, timestamp, is_edited, preview_url, preview_title, preview_description, \
     preview_image_url, client_key";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Append a message to a conversation.
    ///
    /// The creator gets a read receipt on their own message.  If the draft
    /// carries a client key the same creator already used in this
    /// conversation, the earlier message is returned and nothing is written.
    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        creator: &UserId,
        draft: &MessageDraft,
        max_content_len: Option<usize>,
    ) -> Result<Appended> {
        draft.validate(max_content_len)?;

        let tx = self.conn_mut().transaction()?;
        ensure_conversation(&tx, conversation_id)?;

        if let Some(key) = draft.client_key {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM messages
                     WHERE conversation_id = ?1 AND creator_id = ?2 AND client_key = ?3",
                    params![conversation_id.to_string(), creator.as_str(), key.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id_str) = existing {
                let id = MessageId(parse_uuid(0, &id_str)?);
                let message = load_message(&tx, conversation_id, id)?;
                tracing::debug!(
                    conversation = %conversation_id,
                    message = %id,
                    "client key already used, returning original message"
                );
                return Ok(Appended {
                    message,
                    is_new: false,
                });
            }
        }

        let newest: Option<String> = tx.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;

        let mut timestamp = codec::now();
        if let Some(newest) = newest {
            let newest = parse_ts(0, &newest)?;
            if newest >= timestamp {
                timestamp = newest + chrono::Duration::microseconds(1);
            }
        }

        let id = MessageId::new();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, creator_id, kind, content, file_url,
                                   file_name, timestamp, is_edited, client_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                id.to_string(),
                conversation_id.to_string(),
                creator.as_str(),
                draft.kind.as_str(),
                draft.content,
                draft.file.as_ref().map(|f| f.url.as_str()),
                draft.file.as_ref().map(|f| f.name.as_str()),
                encode_ts(&timestamp),
                draft.client_key.map(|k| k.to_string()),
            ],
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![id.to_string(), creator.as_str(), encode_ts(&timestamp)],
        )?;

        tx.execute(
            "UPDATE conversations SET last_message_id = ?1 WHERE id = ?2",
            params![id.to_string(), conversation_id.to_string()],
        )?;

        // A new message brings a soft-deleted conversation back.
        tx.execute(
            "UPDATE direct_participants SET hidden = 0 WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
        )?;

        tx.commit()?;

        Ok(Appended {
            message: Message {
                id,
                conversation_id,
                creator_id: creator.clone(),
                kind: draft.kind,
                content: draft.content.clone(),
                file: draft.file.clone(),
                timestamp,
                is_edited: false,
                reactions: IndexMap::new(),
                read_by: BTreeMap::from([(creator.clone(), timestamp)]),
                link_preview: None,
                client_key: draft.client_key,
            },
            is_new: true,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message with reactions and receipts.
    pub fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Message> {
        load_message(self.conn(), conversation_id, message_id)
    }

    /// Every message of a conversation, ascending by `(timestamp, id)`.
    pub fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        ensure_conversation(self.conn(), conversation_id)?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        hydrate(self.conn(), conversation_id, &mut messages)?;
        Ok(messages)
    }

    /// Up to `limit` messages older than `before` (or the newest ones when
    /// `before` is `None`), returned ascending.
    pub fn list_messages_page(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        ensure_conversation(self.conn(), conversation_id)?;

        let mut messages = Vec::new();
        match before {
            Some(anchor) => {
                let anchor_ts: String = self
                    .conn()
                    .query_row(
                        "SELECT timestamp FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        params![anchor.to_string(), conversation_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::not_found(format!("message {anchor}")))?;

                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                       AND (timestamp < ?2 OR (timestamp = ?2 AND id < ?3))
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?4"
                ))?;
                let rows = stmt.query_map(
                    params![
                        conversation_id.to_string(),
                        anchor_ts,
                        anchor.to_string(),
                        limit
                    ],
                    row_to_message,
                )?;
                for row in rows {
                    messages.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2"
                ))?;
                let rows =
                    stmt.query_map(params![conversation_id.to_string(), limit], row_to_message)?;
                for row in rows {
                    messages.push(row?);
                }
            }
        }

        messages.reverse();
        hydrate(self.conn(), conversation_id, &mut messages)?;
        Ok(messages)
    }

    /// The message the `last_message_id` projection points at, if any.
    pub fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let record = self.get_conversation_record(conversation_id)?;
        record
            .last_message_id
            .map(|id| load_message(self.conn(), conversation_id, id))
            .transpose()
    }

    /// Number of messages `user` has not read, excluding their own.
    pub fn unread_count(&self, conversation_id: ConversationId, user: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.creator_id != ?2
               AND NOT EXISTS (
                   SELECT 1 FROM read_receipts r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )",
            params![conversation_id.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Ids of the messages counted by [`Database::unread_count`].
    pub fn unread_message_ids(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.id FROM messages m
             WHERE m.conversation_id = ?1
               AND m.creator_id != ?2
               AND NOT EXISTS (
                   SELECT 1 FROM read_receipts r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )
             ORDER BY m.timestamp ASC, m.id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string(), user.as_str()], |row| {
            let id: String = row.get(0)?;
            Ok(MessageId(parse_uuid(0, &id)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replace the content of a text message.  Only its creator may do this.
    ///
    /// The previous content is not retained and any cached link preview is
    /// cleared.
    pub fn edit_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        actor: &UserId,
        new_content: &str,
        max_content_len: Option<usize>,
    ) -> Result<Message> {
        let tx = self.conn_mut().transaction()?;
        let current = load_message(&tx, conversation_id, message_id)?;

        if &current.creator_id != actor {
            return Err(StoreError::Permission(
                "only the creator can edit a message".to_string(),
            ));
        }
        if current.kind != MessageKind::Text {
            return Err(StoreError::InvalidState(format!(
                "cannot edit a {} message",
                current.kind.as_str()
            )));
        }
        MessageDraft::text(new_content).validate(max_content_len)?;

        tx.execute(
            "UPDATE messages
             SET content = ?1, is_edited = 1,
                 preview_url = NULL, preview_title = NULL,
                 preview_description = NULL, preview_image_url = NULL
             WHERE id = ?2",
            params![new_content, message_id.to_string()],
        )?;

        let updated = load_message(&tx, conversation_id, message_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Attach a resolved link preview.  Returns `false` if the message is
    /// gone or was edited and no longer mentions the URL.
    pub fn set_link_preview(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        preview: &LinkPreview,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET preview_url = ?1, preview_title = ?2,
                 preview_description = ?3, preview_image_url = ?4
             WHERE id = ?5 AND conversation_id = ?6 AND instr(content, ?1) > 0",
            params![
                preview.url,
                preview.title,
                preview.description,
                preview.image_url,
                message_id.to_string(),
                conversation_id.to_string(),
            ],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Hard-delete a message.  Only its creator may do this.
    ///
    /// Returns the new `last_message_id` projection of the conversation,
    /// `None` when no messages remain.
    pub fn delete_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        actor: &UserId,
    ) -> Result<Option<MessageId>> {
        let tx = self.conn_mut().transaction()?;

        let creator: String = tx
            .query_row(
                "SELECT creator_id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![message_id.to_string(), conversation_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;

        if creator != actor.as_str() {
            return Err(StoreError::Permission(
                "only the creator can delete a message".to_string(),
            ));
        }

        tx.execute(
            "DELETE FROM messages WHERE id = ?1",
            params![message_id.to_string()],
        )?;
        let last = refresh_last_message(&tx, conversation_id)?;

        tx.commit()?;
        Ok(last)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Point the projection at the newest remaining message (or clear it).
pub(crate) fn refresh_last_message(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<Option<MessageId>> {
    let newest: Option<String> = conn
        .query_row(
            "SELECT id FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT 1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute(
        "UPDATE conversations SET last_message_id = ?1 WHERE id = ?2",
        params![newest, conversation_id.to_string()],
    )?;

    newest
        .map(|id| parse_uuid(0, &id).map(MessageId).map_err(StoreError::from))
        .transpose()
}

pub(crate) fn load_message(
    conn: &Connection,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<Message> {
    let mut message = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND conversation_id = ?2"
            ),
            params![message_id.to_string(), conversation_id.to_string()],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;

    message.reactions = reactions::reactions_for_message(conn, message_id)?;
    message.read_by = receipts::receipts_for_message(conn, message_id)?;
    Ok(message)
}

/// Attach reactions and receipts to a batch of messages from one conversation.
fn hydrate(
    conn: &Connection,
    conversation_id: ConversationId,
    messages: &mut [Message],
) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let mut reactions: HashMap<MessageId, IndexMap<String, BTreeSet<UserId>>> =
        reactions::reactions_for_conversation(conn, conversation_id)?;
    let mut receipts: HashMap<MessageId, BTreeMap<UserId, DateTime<Utc>>> =
        receipts::receipts_for_conversation(conn, conversation_id)?;

    for message in messages.iter_mut() {
        message.reactions = reactions.remove(&message.id).unwrap_or_default();
        message.read_by = receipts.remove(&message.id).unwrap_or_default();
    }
    Ok(())
}

/// Map a `rusqlite::Row` selected with [`MESSAGE_COLUMNS`] to a [`Message`]
/// without reactions or receipts.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let creator: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let content: Option<String> = row.get(4)?;
    let file_url: Option<String> = row.get(5)?;
    let file_name: Option<String> = row.get(6)?;
    let ts_str: String = row.get(7)?;
    let is_edited: i32 = row.get(8)?;
    let preview_url: Option<String> = row.get(9)?;
    let preview_title: Option<String> = row.get(10)?;
    let preview_description: Option<String> = row.get(11)?;
    let preview_image_url: Option<String> = row.get(12)?;
    let client_key: Option<String> = row.get(13)?;

    let file = file_url.map(|url| FileRef {
        url,
        name: file_name.unwrap_or_default(),
    });

    let link_preview = preview_url.map(|url| LinkPreview {
        url,
        title: preview_title,
        description: preview_description,
        image_url: preview_image_url,
    });

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        conversation_id: ConversationId(parse_uuid(1, &conversation_str)?),
        creator_id: UserId(creator),
        kind: parse_enum::<MessageKind>(3, &kind_str)?,
        content,
        file,
        timestamp: parse_ts(7, &ts_str)?,
        is_edited: is_edited != 0,
        reactions: IndexMap::new(),
        read_by: BTreeMap::new(),
        link_preview,
        client_key: client_key.map(|k| parse_uuid(13, &k)).transpose()?,
    })
}
