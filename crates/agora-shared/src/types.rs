use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a string-backed identifier newtype.
///
/// Backend document ids are opaque strings, so every id wraps a `String`
/// and compares lexicographically.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Authentication-provider user id.
    UserId
);

string_id!(
    /// Channel document id.
    ChannelId
);

string_id!(
    /// Topic document id (unique within its channel).
    TopicId
);

string_id!(MessageId);

string_id!(
    /// Direct-message conversation id, derived from its two participants.
    ConversationId
);

impl UserId {
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl TopicId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ConversationId {
    /// Deterministic id for the conversation between `a` and `b`.
    ///
    /// The participant ids are sorted lexicographically and joined with
    /// `_`, so the result does not depend on argument order.
    pub fn for_participants(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}_{second}"))
    }
}

/// Online/offline marker stored in the presence store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}
