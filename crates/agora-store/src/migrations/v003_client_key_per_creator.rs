use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Client keys are unique per sender within a conversation
DROP INDEX IF EXISTS idx_messages_client_key;

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_creator_client_key
    ON messages(conversation_id, creator_id, client_key)
    WHERE client_key IS NOT NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
