//! Records persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Emoji usage
// ---------------------------------------------------------------------------

/// How often the local user picked an emoji.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmojiUsage {
    pub emoji: String,
    pub use_count: u32,
    pub last_used_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Avatar blob
// ---------------------------------------------------------------------------

/// An avatar image kept locally because the upload endpoint was unreachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvatarBlob {
    /// Unique blob identifier; also the path of its `idb:` URL.
    pub id: Uuid,
    /// User the avatar belongs to.
    pub owner_id: String,
    /// MIME type supplied by the caller.
    pub content_type: String,
    /// BLAKE3 content hash (hex string).
    pub blake3_hash: String,
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// When this blob record was created.
    pub created_at: DateTime<Utc>,
}

impl AvatarBlob {
    /// The synthetic `idb:` URL under which this blob is served.
    pub fn local_url(&self) -> String {
        format!("{}{}", agora_shared::constants::LOCAL_BLOB_SCHEME, self.id)
    }
}
