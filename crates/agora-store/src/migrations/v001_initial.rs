//! v001 -- Initial schema creation.
//!
//! Creates the `kv_entries` table that backs every JSON-valued local-storage
//! scope (unread counts, last-known message counts, ...).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- JSON key/value entries, grouped by scope
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv_entries (
    scope      TEXT NOT NULL,               -- e.g. 'unread_counts'
    key        TEXT NOT NULL,               -- e.g. a peer user id
    json       TEXT NOT NULL,               -- serde_json-encoded value
    updated_at TEXT NOT NULL,               -- ISO-8601 / RFC-3339

    PRIMARY KEY (scope, key)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
