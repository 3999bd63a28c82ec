//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration.

use std::path::PathBuf;

use chrono::FixedOffset;

use agora_shared::constants::TYPING_TTL_SECS;
use agora_shared::time::offset_from_minutes;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding the local database.
    /// Env: `AGORA_DATA_DIR`
    /// Default: `None` (platform data directory).
    pub data_dir: Option<PathBuf>,

    /// HTTP endpoint accepting avatar uploads.
    /// Env: `AGORA_AVATAR_UPLOAD_URL`
    /// Default: `None` (avatars are kept locally).
    pub avatar_upload_url: Option<String>,

    /// Age after which a typing indicator is ignored.
    /// Env: `AGORA_TYPING_TTL_SECS`
    /// Default: `5`
    pub typing_ttl_secs: i64,

    /// Offset used for day grouping and time labels.
    /// Env: `AGORA_UTC_OFFSET_MINUTES`
    /// Default: `0` (UTC)
    pub utc_offset_minutes: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            avatar_upload_url: None,
            typing_ttl_secs: TYPING_TTL_SECS,
            utc_offset_minutes: 0,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("AGORA_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(url) = lookup("AGORA_AVATAR_UPLOAD_URL") {
            let url = url.trim();
            if url.starts_with("http://") || url.starts_with("https://") {
                config.avatar_upload_url = Some(url.to_string());
            } else if !url.is_empty() {
                tracing::warn!(
                    value = %url,
                    "Invalid AGORA_AVATAR_UPLOAD_URL, avatars will be stored locally"
                );
            }
        }

        if let Some(ttl) = lookup("AGORA_TYPING_TTL_SECS") {
            match ttl.parse::<i64>() {
                Ok(parsed) if parsed > 0 => config.typing_ttl_secs = parsed,
                _ => {
                    tracing::warn!(
                        value = %ttl,
                        "Invalid AGORA_TYPING_TTL_SECS, using default"
                    );
                }
            }
        }

        if let Some(offset) = lookup("AGORA_UTC_OFFSET_MINUTES") {
            match offset.parse::<i32>() {
                Ok(parsed) if parsed.abs() < 24 * 60 => config.utc_offset_minutes = parsed,
                _ => {
                    tracing::warn!(
                        value = %offset,
                        "Invalid AGORA_UTC_OFFSET_MINUTES, using UTC"
                    );
                }
            }
        }

        config
    }

    pub fn typing_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.typing_ttl_secs)
    }

    pub fn utc_offset(&self) -> FixedOffset {
        offset_from_minutes(self.utc_offset_minutes)
    }
}
