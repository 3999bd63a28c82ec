use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS emoji_usage (
    emoji       TEXT PRIMARY KEY NOT NULL,  -- emoji character(s)
    use_count   INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT NOT NULL              -- ISO-8601
);

CREATE INDEX IF NOT EXISTS idx_emoji_usage_rank
    ON emoji_usage(use_count DESC, last_used_at DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
