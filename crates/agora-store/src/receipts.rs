//! Read receipts.
//!
//! Receipts only ever grow.  The first read instant recorded for a
//! `(message, user)` pair is kept; later marks are no-ops.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use agora_shared::types::{ConversationId, MessageId, UserId};

use crate::codec::{self, encode_ts, parse_ts, parse_uuid};
use crate::conversations::ensure_conversation;
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Record that `user` read `message_ids`.
    ///
    /// Ids that do not belong to the conversation are skipped.  Returns the
    /// ids that gained a receipt with this call.
    pub fn mark_read(
        &mut self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let tx = self.conn_mut().transaction()?;
        ensure_conversation(&tx, conversation_id)?;

        let read_at = encode_ts(&codec::now());
        let mut newly_read = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 SELECT id, ?2, ?3 FROM messages WHERE id = ?1 AND conversation_id = ?4",
            )?;
            for id in message_ids {
                let affected = stmt.execute(params![
                    id.to_string(),
                    user.as_str(),
                    read_at,
                    conversation_id.to_string(),
                ])?;
                if affected > 0 {
                    newly_read.push(*id);
                }
            }
        }

        tx.commit()?;

        if !newly_read.is_empty() {
            tracing::debug!(
                conversation = %conversation_id,
                user = %user,
                count = newly_read.len(),
                "marked messages read"
            );
        }
        Ok(newly_read)
    }
}

pub(crate) fn receipts_for_message(
    conn: &Connection,
    message_id: MessageId,
) -> Result<BTreeMap<UserId, DateTime<Utc>>> {
    let mut stmt =
        conn.prepare("SELECT user_id, read_at FROM read_receipts WHERE message_id = ?1")?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        let user: String = row.get(0)?;
        let read_at: String = row.get(1)?;
        Ok((UserId(user), parse_ts(1, &read_at)?))
    })?;

    let mut map = BTreeMap::new();
    for row in rows {
        let (user, read_at) = row?;
        map.insert(user, read_at);
    }
    Ok(map)
}

pub(crate) fn receipts_for_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<HashMap<MessageId, BTreeMap<UserId, DateTime<Utc>>>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.read_at
         FROM read_receipts r
         JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = ?1",
    )?;
    let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
        let message_id: String = row.get(0)?;
        let user: String = row.get(1)?;
        let read_at: String = row.get(2)?;
        Ok((
            MessageId(parse_uuid(0, &message_id)?),
            UserId(user),
            parse_ts(2, &read_at)?,
        ))
    })?;

    let mut map: HashMap<MessageId, BTreeMap<UserId, DateTime<Utc>>> = HashMap::new();
    for row in rows {
        let (message_id, user, read_at) = row?;
        map.entry(message_id).or_default().insert(user, read_at);
    }
    Ok(map)
}
