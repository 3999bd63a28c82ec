//! Channel, topic and direct-message operations.
//!
//! Thin wrappers over [`DocumentBackend`]: they build the documents, stamp
//! ids and timestamps, and log failed writes before returning them.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use agora_shared::constants::{DEFAULT_TOPIC_NAME, MAX_MESSAGE_CHARS};
use agora_shared::{
    Channel, ChannelId, ConversationId, DirectMessage, DirectMessageConversation, Message,
    MessageId, MessageRef, Reactions, Topic, TopicId, TypingIndicator, UserId,
};

use crate::backend::{tolerate_permission_errors, BackendError, DocumentBackend};
use crate::error::{ClientError, Result};
use crate::subscription::{lock, Subscription};

/// Log a failed backend call and convert its error.
fn logged<T>(op: &'static str, result: std::result::Result<T, BackendError>) -> Result<T> {
    result.map_err(|e| {
        error!(op, error = %e, "backend operation failed");
        ClientError::from(e)
    })
}

fn validate_text(text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidInput("message is empty".into()));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ClientError::InvalidInput(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_name(kind: &str, name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidInput(format!("{kind} name is empty")));
    }
    Ok(trimmed.to_string())
}

pub struct ChatService<B: DocumentBackend> {
    backend: Arc<B>,
    typing_ttl: chrono::Duration,
}

impl<B: DocumentBackend> ChatService<B> {
    pub fn new(backend: Arc<B>, typing_ttl: chrono::Duration) -> Self {
        Self {
            backend,
            typing_ttl,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Create a channel owned by `owner`, with a default topic and the
    /// owner as its first member.
    pub async fn create_channel(
        &self,
        name: &str,
        description: &str,
        owner: &UserId,
    ) -> Result<Channel> {
        let name = validate_name("channel", name)?;
        let now = Utc::now();
        let channel = Channel {
            id: ChannelId::generate(),
            name,
            description: description.trim().to_string(),
            owner_id: owner.clone(),
            created_at: now,
            updated_at: now,
        };

        logged("create_channel", self.backend.put_channel(channel.clone()).await)?;
        let topic = Topic {
            id: TopicId::generate(),
            channel_id: channel.id.clone(),
            name: DEFAULT_TOPIC_NAME.to_string(),
            last_message_at: None,
        };
        logged("create_topic", self.backend.put_topic(topic).await)?;
        logged("add_member", self.backend.add_member(&channel.id, owner).await)?;

        info!(channel = %channel.id, owner = %owner, "channel created");
        Ok(channel)
    }

    /// Rename and/or re-describe a channel.  `None` leaves a field as is.
    pub async fn update_channel(
        &self,
        channel_id: &ChannelId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Channel> {
        let mut channel = logged("get_channel", self.backend.get_channel(channel_id).await)?;
        if let Some(name) = name {
            channel.name = validate_name("channel", name)?;
        }
        if let Some(description) = description {
            channel.description = description.trim().to_string();
        }
        channel.updated_at = Utc::now();
        logged("update_channel", self.backend.put_channel(channel.clone()).await)?;
        Ok(channel)
    }

    pub async fn delete_channel(&self, channel_id: &ChannelId) -> Result<()> {
        logged("delete_channel", self.backend.delete_channel(channel_id).await)?;
        info!(channel = %channel_id, "channel deleted");
        Ok(())
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        logged("list_channels", self.backend.list_channels().await)
    }

    pub async fn join_channel(&self, channel_id: &ChannelId, user: &UserId) -> Result<()> {
        logged("join_channel", self.backend.add_member(channel_id, user).await)
    }

    pub async fn leave_channel(&self, channel_id: &ChannelId, user: &UserId) -> Result<()> {
        logged("leave_channel", self.backend.remove_member(channel_id, user).await)
    }

    pub async fn members(&self, channel_id: &ChannelId) -> Result<BTreeSet<UserId>> {
        logged("list_members", self.backend.list_members(channel_id).await)
    }

    pub async fn create_topic(&self, channel_id: &ChannelId, name: &str) -> Result<Topic> {
        let topic = Topic {
            id: TopicId::generate(),
            channel_id: channel_id.clone(),
            name: validate_name("topic", name)?,
            last_message_at: None,
        };
        logged("create_topic", self.backend.put_topic(topic.clone()).await)?;
        Ok(topic)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Post to a topic.  `parent` makes the message a thread reply.
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        topic_id: &TopicId,
        sender: &UserId,
        text: &str,
        parent: Option<MessageId>,
    ) -> Result<Message> {
        let message = Message {
            id: MessageId::generate(),
            text: validate_text(text)?,
            sender_id: sender.clone(),
            timestamp: Utc::now(),
            topic_id: topic_id.clone(),
            channel_id: channel_id.clone(),
            parent_message_id: parent,
            reactions: Reactions::new(),
            thread_count: 0,
            edited_at: None,
        };
        logged("send_message", self.backend.add_message(message.clone()).await)?;
        Ok(message)
    }

    pub async fn edit_message(&self, target: &MessageRef, text: &str) -> Result<()> {
        let text = validate_text(text)?;
        logged("edit_message", self.backend.edit_message(target, text).await)
    }

    pub async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        logged("delete_message", self.backend.delete_message(target).await)
    }

    // ------------------------------------------------------------------
    // Direct messages
    // ------------------------------------------------------------------

    /// Get or create the conversation between `me` and `peer`.
    pub async fn open_conversation(
        &self,
        me: &UserId,
        peer: &UserId,
    ) -> Result<DirectMessageConversation> {
        if me == peer {
            return Err(ClientError::InvalidInput(
                "cannot open a conversation with yourself".into(),
            ));
        }
        let conversation = DirectMessageConversation::between(me, peer, Utc::now());
        logged(
            "open_conversation",
            self.backend.ensure_conversation(conversation).await,
        )
    }

    pub async fn send_direct_message(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        text: &str,
    ) -> Result<DirectMessage> {
        let message = DirectMessage {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            sender_id: sender.clone(),
            text: validate_text(text)?,
            timestamp: Utc::now(),
            reactions: Reactions::new(),
        };
        logged(
            "send_direct_message",
            self.backend.add_direct_message(message.clone()).await,
        )?;
        Ok(message)
    }

    pub fn watch_direct_messages(
        &self,
        conversation_id: &ConversationId,
        handler: impl FnMut(std::result::Result<Vec<DirectMessage>, BackendError>) + Send + 'static,
    ) -> Subscription {
        self.backend
            .watch_direct_messages(conversation_id, Box::new(tolerate_permission_errors(handler)))
    }

    pub fn watch_conversations(
        &self,
        user: &UserId,
        handler: impl FnMut(std::result::Result<Vec<DirectMessageConversation>, BackendError>)
            + Send
            + 'static,
    ) -> Subscription {
        self.backend
            .watch_conversations(user, Box::new(tolerate_permission_errors(handler)))
    }

    // ------------------------------------------------------------------
    // Typing indicators
    // ------------------------------------------------------------------

    pub async fn set_typing(&self, scope: &str, user: &UserId) -> Result<()> {
        let indicator = TypingIndicator {
            user_id: user.clone(),
            updated_at: Utc::now(),
        };
        logged("set_typing", self.backend.set_typing(scope, indicator).await)
    }

    pub async fn clear_typing(&self, scope: &str, user: &UserId) -> Result<()> {
        logged("clear_typing", self.backend.clear_typing(scope, user).await)
    }

    /// Users other than `me` currently typing in `scope`.  Stale indicators
    /// are dropped.
    ///
    /// Inside a tokio runtime the list is also re-filtered on a timer, so an
    /// indicator whose owner went quiet disappears once it outlives the TTL
    /// even if the backend never emits again.
    pub fn watch_typing(
        &self,
        scope: &str,
        me: &UserId,
        handler: impl FnMut(std::result::Result<Vec<UserId>, BackendError>) + Send + 'static,
    ) -> Subscription {
        let view = Arc::new(Mutex::new(TypingView {
            me: me.clone(),
            ttl: self.typing_ttl,
            indicators: Vec::new(),
            visible: None,
            handler,
        }));

        let live = Arc::clone(&view);
        let upstream = self.backend.watch_typing(
            scope,
            Box::new(tolerate_permission_errors(
                move |result: std::result::Result<Vec<TypingIndicator>, BackendError>| {
                    lock(&live).update(result)
                },
            )),
        );

        let expiry = tokio::runtime::Handle::try_current().ok().map(|runtime| {
            let period = expiry_period(self.typing_ttl);
            runtime.spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tick.tick().await;
                    lock(&view).expire();
                }
            })
        });

        Subscription::new(move || {
            if let Some(task) = expiry {
                task.abort();
            }
            upstream.unsubscribe();
        })
    }
}

/// How often a typing watch re-checks indicator ages.
fn expiry_period(ttl: chrono::Duration) -> Duration {
    ttl.to_std()
        .map(|ttl| ttl / 2)
        .unwrap_or(Duration::ZERO)
        .clamp(Duration::from_millis(10), Duration::from_secs(1))
}

/// Last indicators seen for one typing scope and what the handler was told.
struct TypingView<F> {
    me: UserId,
    ttl: chrono::Duration,
    indicators: Vec<TypingIndicator>,
    visible: Option<Vec<UserId>>,
    handler: F,
}

impl<F> TypingView<F>
where
    F: FnMut(std::result::Result<Vec<UserId>, BackendError>),
{
    fn fresh_users(&self) -> Vec<UserId> {
        let now = Utc::now();
        self.indicators
            .iter()
            .filter(|i| i.user_id != self.me && i.is_fresh(now, self.ttl))
            .map(|i| i.user_id.clone())
            .collect()
    }

    fn update(&mut self, result: std::result::Result<Vec<TypingIndicator>, BackendError>) {
        match result {
            Ok(indicators) => {
                self.indicators = indicators;
                let users = self.fresh_users();
                self.visible = Some(users.clone());
                (self.handler)(Ok(users));
            }
            Err(e) => (self.handler)(Err(e)),
        }
    }

    /// Emit again only when an indicator aged out since the last emission.
    fn expire(&mut self) {
        let Some(visible) = &self.visible else {
            return;
        };
        let users = self.fresh_users();
        if &users != visible {
            debug!(expired = visible.len().saturating_sub(users.len()), "typing indicators aged out");
            self.visible = Some(users.clone());
            (self.handler)(Ok(users));
        }
    }
}
