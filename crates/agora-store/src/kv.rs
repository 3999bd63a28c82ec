//! JSON key/value storage grouped by scope.
//!
//! Each scope is a flat namespace of string keys whose values are
//! `serde_json`-encoded.  This is the local-storage layer the client uses for
//! counters and other small best-effort state.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert or replace the value stored under `scope`/`key`.
    pub fn put_json<T: Serialize>(&self, scope: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO kv_entries (scope, key, json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![scope, key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fetch and decode the value stored under `scope`/`key`.
    pub fn get_json<T: DeserializeOwned>(&self, scope: &str, key: &str) -> Result<Option<T>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT json FROM kv_entries WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete one entry.  Returns `true` if a row was deleted.
    pub fn remove_json(&self, scope: &str, key: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM kv_entries WHERE scope = ?1 AND key = ?2",
            params![scope, key],
        )?;
        Ok(affected > 0)
    }

    /// Load every entry of a scope.
    ///
    /// Entries that no longer decode as `T` are skipped with a warning
    /// rather than failing the whole load.
    pub fn load_scope<T: DeserializeOwned>(&self, scope: &str) -> Result<HashMap<String, T>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT key, json FROM kv_entries WHERE scope = ?1")?;

        let rows = stmt.query_map(params![scope], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = HashMap::new();
        for row in rows {
            let (key, json) = row?;
            match serde_json::from_str(&json) {
                Ok(value) => {
                    entries.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(scope, key = %key, error = %e, "skipping corrupt local entry");
                }
            }
        }
        Ok(entries)
    }

    /// Delete every entry of a scope.  Returns the number of rows removed.
    pub fn clear_scope(&self, scope: &str) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv_entries WHERE scope = ?1", params![scope])?;
        Ok(affected)
    }
}
