//! v001 -- Initial schema creation.
//!
//! Conversations of both kinds share the `conversations` table; direct
//! participants and group metadata hang off it.  Messages, reactions and
//! receipts cascade away with their conversation.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations (direct + group)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind            TEXT NOT NULL,              -- 'direct' | 'group'
    last_message_id TEXT,                       -- denormalized newest message
    created_at      TEXT NOT NULL               -- RFC-3339, micros, UTC
);

CREATE TABLE IF NOT EXISTS direct_participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    display_name    TEXT,                       -- snapshot at creation
    photo_url       TEXT,                       -- snapshot at creation
    pinned          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    hidden          INTEGER NOT NULL DEFAULT 0, -- one-sided soft delete

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_direct_participants_user
    ON direct_participants(user_id);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id          TEXT PRIMARY KEY NOT NULL,      -- = conversations.id
    name        TEXT NOT NULL,
    description TEXT,
    photo_url   TEXT,
    creator_id  TEXT NOT NULL,
    pin_hash    TEXT,                           -- hex BLAKE3, NULL = open group

    FOREIGN KEY (id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    creator_id      TEXT NOT NULL,
    kind            TEXT NOT NULL,              -- text | image | video | audio | file
    content         TEXT,
    file_url        TEXT,
    file_name       TEXT,
    timestamp       TEXT NOT NULL,
    is_edited       INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp, id);

-- ----------------------------------------------------------------
-- Reactions (additive; one row per user+emoji)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_reactions_unique
    ON reactions(message_id, user_id, emoji);

-- ----------------------------------------------------------------
-- Read receipts (additive; first read instant wins)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Blocks (directed: blocker -> blocked)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    blocker_id TEXT NOT NULL,
    blocked_id TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (blocker_id, blocked_id)
);

-- ----------------------------------------------------------------
-- Per-viewer chat locks
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_locks (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    pin_hash        TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
