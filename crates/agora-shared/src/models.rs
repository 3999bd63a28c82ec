//! Domain entities exchanged with the document backend.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be decoded
//! straight from a backend document and handed to the view layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reactions::Reactions;
use crate::types::{ChannelId, ConversationId, MessageId, PresenceState, TopicId, UserId};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A top-level channel.  Membership lives in a separate relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A sub-partition of a channel's messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: TopicId,
    pub channel_id: ChannelId,
    pub name: String,
    /// Timestamp of the newest message posted to this topic, if any.
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Channel message
// ---------------------------------------------------------------------------

/// A message posted to a channel topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub topic_id: TopicId,
    pub channel_id: ChannelId,
    /// Thread root this message replies to.  `None` for root messages.
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub reactions: Reactions,
    /// Number of replies in the channel pointing at this message.
    ///
    /// Derived on the client by the timeline merge; never written back.
    #[serde(default, skip_serializing)]
    pub thread_count: u32,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }

    pub fn is_reply_to(&self, parent: &MessageId) -> bool {
        self.parent_message_id.as_ref() == Some(parent)
    }
}

// ---------------------------------------------------------------------------
// Direct messages
// ---------------------------------------------------------------------------

/// A 1:1 conversation between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessageConversation {
    pub id: ConversationId,
    pub participants: [UserId; 2],
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl DirectMessageConversation {
    pub fn between(a: &UserId, b: &UserId, created_at: DateTime<Utc>) -> Self {
        let mut participants = [a.clone(), b.clone()];
        participants.sort();
        Self {
            id: ConversationId::for_participants(a, b),
            participants,
            created_at,
            last_message_at: None,
        }
    }

    /// The participant that is not `me`.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        if &self.participants[0] == me {
            Some(&self.participants[1])
        } else if &self.participants[1] == me {
            Some(&self.participants[0])
        } else {
            None
        }
    }
}

/// A message inside a direct conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Reactions,
}

// ---------------------------------------------------------------------------
// Message addressing
// ---------------------------------------------------------------------------

/// Location of a message document, channel or direct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageRef {
    Channel {
        channel_id: ChannelId,
        topic_id: TopicId,
        message_id: MessageId,
    },
    Direct {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

impl MessageRef {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Channel { message_id, .. } | Self::Direct { message_id, .. } => message_id,
        }
    }
}

impl From<&Message> for MessageRef {
    fn from(m: &Message) -> Self {
        Self::Channel {
            channel_id: m.channel_id.clone(),
            topic_id: m.topic_id.clone(),
            message_id: m.id.clone(),
        }
    }
}

impl From<&DirectMessage> for MessageRef {
    fn from(m: &DirectMessage) -> Self {
        Self::Direct {
            conversation_id: m.conversation_id.clone(),
            message_id: m.id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence & typing
// ---------------------------------------------------------------------------

/// Value stored at `status/{uid}` in the presence store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub state: PresenceState,
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn online(at: DateTime<Utc>) -> Self {
        Self {
            state: PresenceState::Online,
            last_seen_at: at,
        }
    }

    pub fn offline(at: DateTime<Utc>) -> Self {
        Self {
            state: PresenceState::Offline,
            last_seen_at: at,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == PresenceState::Online
    }
}

/// A "user is typing" marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub updated_at: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.updated_at) < ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn conversation_between_sorts_participants() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let conv = DirectMessageConversation::between(&"zoe".into(), &"adam".into(), at);
        assert_eq!(conv.id.as_str(), "adam_zoe");
        assert_eq!(conv.participants[0].as_str(), "adam");
        assert_eq!(conv.peer_of(&"zoe".into()).map(UserId::as_str), Some("adam"));
        assert!(conv.peer_of(&"eve".into()).is_none());
    }

    #[test]
    fn thread_count_is_not_serialized() {
        let msg = Message {
            id: "m1".into(),
            text: "hi".into(),
            sender_id: "u1".into(),
            timestamp: Utc.timestamp_opt(10, 0).unwrap(),
            topic_id: "t1".into(),
            channel_id: "c1".into(),
            parent_message_id: None,
            reactions: Reactions::default(),
            thread_count: 4,
            edited_at: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("thread_count").is_none());
    }

    #[test]
    fn typing_indicator_expires() {
        let at = Utc.timestamp_opt(100, 0).unwrap();
        let typing = TypingIndicator {
            user_id: "u1".into(),
            updated_at: at,
        };
        let ttl = chrono::Duration::seconds(5);
        assert!(typing.is_fresh(at + chrono::Duration::seconds(4), ttl));
        assert!(!typing.is_fresh(at + chrono::Duration::seconds(5), ttl));
    }
}
