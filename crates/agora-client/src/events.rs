//! Event channel between the client core and the view layer.
//!
//! The core pushes [`ClientEvent`]s; the view layer sends [`Action`]s back.
//! Both travel over unbounded tokio channels so neither side blocks inside a
//! backend callback.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;

use agora_shared::{
    ChannelId, ConversationId, DirectMessage, Message, MessageId, MessageRef, PresenceRecord,
    TopicId, UserId,
};

use crate::presence::PresenceStatus;

/// Notifications for the view layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Root messages of the selected channel, with thread counts.
    TimelineUpdated {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    ThreadUpdated {
        channel_id: ChannelId,
        parent_id: MessageId,
        replies: Vec<Message>,
    },
    DirectMessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<DirectMessage>,
    },
    UnreadChanged {
        counts: HashMap<UserId, u32>,
        total: u32,
    },
    PresenceChanged {
        user_id: UserId,
        record: Option<PresenceRecord>,
    },
    OwnPresenceChanged {
        #[serde(serialize_with = "status_name")]
        status: PresenceStatus,
    },
    TypingChanged {
        scope: String,
        users: Vec<UserId>,
    },
    /// A user-facing error message (already localised).
    Error { message: String },
}

/// Requests from the view layer.
#[derive(Debug, Clone)]
pub enum Action {
    SelectChannel {
        channel_id: ChannelId,
        topic_id: Option<TopicId>,
    },
    OpenThread(MessageId),
    CloseThread,
    OpenConversation(UserId),
    SendMessage {
        channel_id: ChannelId,
        topic_id: TopicId,
        text: String,
        parent: Option<MessageId>,
    },
    SendDirectMessage {
        conversation_id: ConversationId,
        text: String,
    },
    React {
        target: MessageRef,
        emoji: String,
    },
    SignOut,
}

fn status_name<S: serde::Serializer>(status: &PresenceStatus, s: S) -> Result<S::Ok, S::Error> {
    let name = match status {
        PresenceStatus::Disconnected => "disconnected",
        PresenceStatus::ConnectedPending => "connecting",
        PresenceStatus::Online => "online",
        PresenceStatus::Offline => "offline",
    };
    s.serialize_str(name)
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send `event`, logging instead of failing when the view layer is gone.
pub fn emit_event(tx: &EventSender, event: ClientEvent) {
    if let Err(e) = tx.send(event) {
        tracing::error!(event = ?e.0, "Failed to emit event, receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = ClientEvent::OwnPresenceChanged {
            status: PresenceStatus::ConnectedPending,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "own-presence-changed");
        assert_eq!(json["status"], "connecting");
    }

    #[tokio::test]
    async fn emit_delivers_in_order_and_survives_closed_receiver() {
        let (tx, mut rx) = event_channel();
        emit_event(&tx, ClientEvent::Error { message: "a".into() });
        emit_event(&tx, ClientEvent::Error { message: "b".into() });

        for want in ["a", "b"] {
            match rx.recv().await {
                Some(ClientEvent::Error { message }) => assert_eq!(message, want),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        drop(rx);
        emit_event(&tx, ClientEvent::Error { message: "lost".into() });
    }
}
