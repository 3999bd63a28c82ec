use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Avatars that could not be uploaded, served back through `idb:` URLs
CREATE TABLE IF NOT EXISTS avatar_blobs (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner_id     TEXT NOT NULL,               -- user id the avatar belongs to
    content_type TEXT NOT NULL,
    blake3_hash  TEXT NOT NULL,
    data         BLOB NOT NULL,
    created_at   TEXT NOT NULL                -- ISO-8601
);

CREATE INDEX IF NOT EXISTS idx_avatar_blobs_owner ON avatar_blobs(owner_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_avatar_blobs_hash ON avatar_blobs(owner_id, blake3_hash);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
