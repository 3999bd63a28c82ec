//! Local fallback storage for avatar images.
//!
//! When the avatar upload endpoint is unavailable the image is stored here
//! and addressed with a synthetic `idb:{uuid}` URL.

use agora_shared::constants::{LOCAL_BLOB_SCHEME, MAX_AVATAR_SIZE};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::AvatarBlob;

impl Database {
    /// Store an avatar for `owner_id` and return its record.
    ///
    /// Storing identical bytes twice for the same owner returns the existing
    /// record instead of a duplicate.
    pub fn store_avatar_blob(
        &self,
        owner_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<AvatarBlob> {
        if data.len() > MAX_AVATAR_SIZE {
            return Err(StoreError::BlobTooLarge {
                size: data.len(),
                max: MAX_AVATAR_SIZE,
            });
        }

        let hash = blake3::hash(data).to_hex().to_string();

        let existing = self
            .conn()
            .query_row(
                "SELECT id, owner_id, content_type, blake3_hash, data, created_at
                 FROM avatar_blobs
                 WHERE owner_id = ?1 AND blake3_hash = ?2",
                params![owner_id, hash],
                row_to_blob,
            )
            .optional()?;
        if let Some(blob) = existing {
            tracing::debug!(id = %blob.id, owner = owner_id, "avatar blob already stored");
            return Ok(blob);
        }

        let blob = AvatarBlob {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            content_type: content_type.to_string(),
            blake3_hash: hash,
            data: data.to_vec(),
            created_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT INTO avatar_blobs (id, owner_id, content_type, blake3_hash, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                blob.id.to_string(),
                blob.owner_id,
                blob.content_type,
                blob.blake3_hash,
                blob.data,
                blob.created_at.to_rfc3339(),
            ],
        )?;

        tracing::info!(id = %blob.id, owner = owner_id, size = data.len(), "avatar stored locally");
        Ok(blob)
    }

    pub fn get_avatar_blob(&self, id: Uuid) -> Result<AvatarBlob> {
        self.conn()
            .query_row(
                "SELECT id, owner_id, content_type, blake3_hash, data, created_at
                 FROM avatar_blobs
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_blob,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Resolve an `idb:{uuid}` URL to its stored blob.
    pub fn resolve_local_url(&self, url: &str) -> Result<AvatarBlob> {
        let id = url
            .strip_prefix(LOCAL_BLOB_SCHEME)
            .ok_or_else(|| StoreError::NotLocalUrl(url.to_string()))?;
        self.get_avatar_blob(Uuid::parse_str(id)?)
    }

    /// Delete every stored avatar of `owner_id`.  Returns the number removed.
    pub fn delete_avatar_blobs(&self, owner_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM avatar_blobs WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(affected)
    }
}

/// Map a `rusqlite::Row` to an [`AvatarBlob`].
fn row_to_blob(row: &rusqlite::Row<'_>) -> rusqlite::Result<AvatarBlob> {
    let id_str: String = row.get(0)?;
    let owner_id: String = row.get(1)?;
    let content_type: String = row.get(2)?;
    let blake3_hash: String = row.get(3)?;
    let data: Vec<u8> = row.get(4)?;
    let created_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AvatarBlob {
        id,
        owner_id,
        content_type,
        blake3_hash,
        data,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_resolve() {
        let db = Database::open_in_memory().unwrap();
        let blob = db.store_avatar_blob("alice", "image/png", &[1, 2, 3]).unwrap();

        let url = blob.local_url();
        assert!(url.starts_with("idb:"));

        let resolved = db.resolve_local_url(&url).unwrap();
        assert_eq!(resolved.data, vec![1, 2, 3]);
        assert_eq!(resolved.content_type, "image/png");
    }

    #[test]
    fn identical_bytes_are_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        let first = db.store_avatar_blob("alice", "image/png", b"same").unwrap();
        let second = db.store_avatar_blob("alice", "image/png", b"same").unwrap();
        assert_eq!(first.id, second.id);

        let other_owner = db.store_avatar_blob("bob", "image/png", b"same").unwrap();
        assert_ne!(first.id, other_owner.id);
        assert_eq!(db.delete_avatar_blobs("alice").unwrap(), 1);
    }

    #[test]
    fn rejects_oversized_and_foreign_urls() {
        let db = Database::open_in_memory().unwrap();
        let big = vec![0u8; MAX_AVATAR_SIZE + 1];
        assert!(matches!(
            db.store_avatar_blob("alice", "image/png", &big),
            Err(StoreError::BlobTooLarge { .. })
        ));
        assert!(matches!(
            db.resolve_local_url("https://cdn.example/a.png"),
            Err(StoreError::NotLocalUrl(_))
        ));
        assert!(matches!(
            db.resolve_local_url(&format!("idb:{}", Uuid::new_v4())),
            Err(StoreError::NotFound)
        ));
    }
}
