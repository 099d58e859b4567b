//! CRUD operations for groups and their membership.
//!
//! The creator is inserted as the first member and can never be removed;
//! the group has to be deleted instead.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use agora_shared::types::{ConversationId, ConversationKind, MessageId, UserId};

use crate::codec::{self, encode_ts, parse_ts, parse_uuid};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupUpdate, NewGroup};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new group with its creator as the only member.
    pub fn create_group(&mut self, new: &NewGroup) -> Result<Group> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("group name cannot be empty".to_string()));
        }

        let id = new.id;
        let now = encode_ts(&codec::now());

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, kind, last_message_id, created_at)
             VALUES (?1, ?2, NULL, ?3)",
            params![id.to_string(), ConversationKind::Group.as_str(), now],
        )?;
        tx.execute(
            "INSERT INTO chat_groups (id, name, description, photo_url, creator_id, pin_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                name,
                new.description,
                new.photo_url,
                new.creator_id.as_str(),
                new.pin_hash,
            ],
        )?;
        tx.execute(
            "INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), new.creator_id.as_str(), now],
        )?;

        let group = load_group(&tx, id)?;
        tx.commit()?;

        tracing::info!(group = %id, creator = %new.creator_id, "created group");
        Ok(group)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a group with its current members.
    pub fn get_group(&self, id: ConversationId) -> Result<Group> {
        load_group(self.conn(), id)
    }

    /// Groups `user` is a member of, ordered by name.
    pub fn list_groups_for_user(&self, user: &UserId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.id FROM chat_groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.name ASC",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| {
            let id: String = row.get(0)?;
            Ok(ConversationId(parse_uuid(0, &id)?))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(load_group(self.conn(), row?)?);
        }
        Ok(groups)
    }

    pub fn group_member_count(&self, id: ConversationId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add `user` to a group.  Returns `false` if they already were a member.
    pub fn add_group_member(&self, id: ConversationId, user: &UserId) -> Result<bool> {
        ensure_group(self.conn(), id)?;
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![id.to_string(), user.as_str(), encode_ts(&codec::now())],
        )?;
        Ok(affected > 0)
    }

    /// Remove `user` from a group.  The creator cannot be removed.
    /// Returns `false` if they were not a member.
    pub fn remove_group_member(&self, id: ConversationId, user: &UserId) -> Result<bool> {
        let creator = ensure_group(self.conn(), id)?;
        if &creator == user {
            return Err(StoreError::InvalidState(
                "the creator cannot leave their own group".to_string(),
            ));
        }

        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![id.to_string(), user.as_str()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a metadata edit.  Fields left as `None` keep their value.
    pub fn update_group(&self, id: ConversationId, update: &GroupUpdate) -> Result<Group> {
        ensure_group(self.conn(), id)?;
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(StoreError::Validation("group name cannot be empty".to_string()));
            }
        }

        self.conn().execute(
            "UPDATE chat_groups
             SET name = COALESCE(?1, name),
                 description = COALESCE(?2, description),
                 photo_url = COALESCE(?3, photo_url)
             WHERE id = ?4",
            params![
                update.name.as_deref().map(str::trim),
                update.description,
                update.photo_url,
                id.to_string(),
            ],
        )?;
        load_group(self.conn(), id)
    }

    /// Replace (or clear, with `None`) the hashed join PIN.
    pub fn set_group_pin_hash(&self, id: ConversationId, pin_hash: Option<&str>) -> Result<()> {
        ensure_group(self.conn(), id)?;
        self.conn().execute(
            "UPDATE chat_groups SET pin_hash = ?1 WHERE id = ?2",
            params![pin_hash, id.to_string()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fail with `NotFound` unless the group exists.  Returns its creator.
fn ensure_group(conn: &Connection, id: ConversationId) -> Result<UserId> {
    conn.query_row(
        "SELECT creator_id FROM chat_groups WHERE id = ?1",
        params![id.to_string()],
        |row| Ok(UserId(row.get(0)?)),
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("group {id}")))
}

fn load_group(conn: &Connection, id: ConversationId) -> Result<Group> {
    let mut group = conn
        .query_row(
            "SELECT g.name, g.description, g.photo_url, g.creator_id, g.pin_hash,
                    c.last_message_id, c.created_at
             FROM chat_groups g
             JOIN conversations c ON c.id = g.id
             WHERE g.id = ?1",
            params![id.to_string()],
            |row| {
                let last: Option<String> = row.get(5)?;
                let created_str: String = row.get(6)?;
                Ok(Group {
                    id,
                    name: row.get(0)?,
                    description: row.get(1)?,
                    photo_url: row.get(2)?,
                    creator_id: UserId(row.get(3)?),
                    members: BTreeSet::new(),
                    pin_hash: row.get(4)?,
                    last_message_id: last
                        .map(|s| parse_uuid(5, &s).map(MessageId))
                        .transpose()?,
                    created_at: parse_ts(6, &created_str)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("group {id}")))?;

    let mut stmt = conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
    let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
    for row in rows {
        group.members.insert(UserId(row?));
    }
    Ok(group)
}
