/// Prefix of per-user presence records (`status/{uid}`).
pub const PRESENCE_PATH_PREFIX: &str = "status";

/// URL scheme for avatars that could only be stored locally.
pub const LOCAL_BLOB_SCHEME: &str = "idb:";

/// Typing indicators older than this are ignored by readers.
pub const TYPING_TTL_SECS: i64 = 5;

/// Name of the topic created with every new channel.
pub const DEFAULT_TOPIC_NAME: &str = "general";

/// Maximum message text length in characters.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Maximum avatar upload size in bytes (5 MiB)
pub const MAX_AVATAR_SIZE: usize = 5 * 1024 * 1024;

/// Local storage scopes (JSON key/value namespaces).
pub const SCOPE_UNREAD_COUNTS: &str = "unread_counts";
pub const SCOPE_MESSAGE_COUNTS: &str = "message_counts";

/// Presence-store path for `user_id`.
pub fn presence_path(user_id: &crate::types::UserId) -> String {
    format!("{PRESENCE_PATH_PREFIX}/{user_id}")
}
