//! v001 -- Initial schema creation.
//!
//! Creates `settings` (single-value keys such as the local peer id) and
//! `messages` (conversation history).

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Settings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,    -- UUID v4
    peer            TEXT NOT NULL,           -- remote side of the conversation
    sender          TEXT NOT NULL,
    text            TEXT NOT NULL,
    timestamp       TEXT NOT NULL,           -- RFC-3339
    attachment_name TEXT,
    attachment_type TEXT,
    attachment_size INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages (peer, seq);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
