use serde::{Deserialize, Serialize};

use crate::error::AgoraError;
use crate::models::{
    Channel, DirectMessage, DirectMessageConversation, Message, PresenceRecord, Topic,
};
use crate::types::UserId;

/// Every document shape the client accepts from the backend.
///
/// Raw JSON is decoded into one of these variants and validated with
/// [`Document::from_json`] before it reaches the rest of the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Document {
    Channel(Channel),
    Topic(Topic),
    ChannelMessage(Message),
    DirectMessage(DirectMessage),
    Conversation(DirectMessageConversation),
    Presence {
        user_id: UserId,
        #[serde(flatten)]
        record: PresenceRecord,
    },
}

impl Document {
    /// Decode and validate a backend payload.
    pub fn from_json(value: serde_json::Value) -> Result<Self, AgoraError> {
        let mut doc: Document = serde_json::from_value(value)?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, AgoraError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reject documents with missing ids and repair reaction maps.
    pub fn validate(&mut self) -> Result<(), AgoraError> {
        match self {
            Self::Channel(c) => {
                require(!c.id.is_empty(), "channel id is empty")?;
                require(!c.name.trim().is_empty(), "channel name is empty")?;
            }
            Self::Topic(t) => {
                require(!t.id.is_empty(), "topic id is empty")?;
                require(!t.channel_id.is_empty(), "topic has no channel")?;
            }
            Self::ChannelMessage(m) => {
                require(!m.id.is_empty(), "message id is empty")?;
                require(!m.channel_id.is_empty(), "message has no channel")?;
                require(!m.topic_id.is_empty(), "message has no topic")?;
                require(
                    m.parent_message_id.as_ref() != Some(&m.id),
                    "message cannot reply to itself",
                )?;
                m.reactions.normalize();
                m.thread_count = 0;
            }
            Self::DirectMessage(m) => {
                require(!m.id.is_empty(), "message id is empty")?;
                require(!m.conversation_id.is_empty(), "message has no conversation")?;
                m.reactions.normalize();
            }
            Self::Conversation(c) => {
                let [a, b] = &c.participants;
                require(
                    c.id == crate::types::ConversationId::for_participants(a, b),
                    "conversation id does not match participants",
                )?;
            }
            Self::Presence { user_id, .. } => {
                require(!user_id.is_empty(), "presence record has no user")?;
            }
        }
        Ok(())
    }
}

fn require(ok: bool, reason: &str) -> Result<(), AgoraError> {
    if ok {
        Ok(())
    } else {
        Err(AgoraError::InvalidDocument(reason.to_string()))
    }
}
