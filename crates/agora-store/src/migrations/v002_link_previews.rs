use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Best-effort link preview written after the message is stored
ALTER TABLE messages ADD COLUMN preview_url TEXT;
ALTER TABLE messages ADD COLUMN preview_title TEXT;
ALTER TABLE messages ADD COLUMN preview_description TEXT;
ALTER TABLE messages ADD COLUMN preview_image_url TEXT;

-- Client idempotency key, unique per conversation
ALTER TABLE messages ADD COLUMN client_key TEXT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_key
    ON messages(conversation_id, client_key)
    WHERE client_key IS NOT NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
