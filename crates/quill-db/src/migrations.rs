use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("DB: running migration v1 (users, chatrooms, messages)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id                  TEXT PRIMARY KEY,
                mobile_number       TEXT NOT NULL UNIQUE,
                subscription_tier   TEXT NOT NULL DEFAULT 'basic',
                created_at          TEXT NOT NULL
            );

            CREATE TABLE chatrooms (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id),
                name        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_chatrooms_user
                ON chatrooms(user_id, created_at);

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                chatroom_id TEXT NOT NULL REFERENCES chatrooms(id),
                sender      TEXT NOT NULL CHECK (sender IN ('user', 'ai')),
                content     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_messages_chatroom
                ON messages(chatroom_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
