//! Block relations.
//!
//! A block is a directed edge stored on the blocking user.  It never deletes
//! history; the engine's access guard decides what it prevents.

use rusqlite::{params, OptionalExtension};

use agora_shared::types::UserId;

use crate::codec::{self, encode_ts};
use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Record that `blocker` blocks `blocked`.  Returns `false` if the edge
    /// already existed.
    pub fn block_user(&self, blocker: &UserId, blocked: &UserId) -> Result<bool> {
        if blocker == blocked {
            return Err(StoreError::Validation("cannot block yourself".to_string()));
        }
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![blocker.as_str(), blocked.as_str(), encode_ts(&codec::now())],
        )?;
        Ok(affected > 0)
    }

    /// Remove a block edge.  Returns `true` if one was removed.
    pub fn unblock_user(&self, blocker: &UserId, blocked: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.as_str(), blocked.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Whether `blocker` has blocked `blocked` (one direction only).
    pub fn is_blocked(&self, blocker: &UserId, blocked: &UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker.as_str(), blocked.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Users `blocker` has blocked, oldest first.
    pub fn blocked_users(&self, blocker: &UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT blocked_id FROM blocks WHERE blocker_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![blocker.as_str()], |row| {
            Ok(UserId(row.get(0)?))
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}
