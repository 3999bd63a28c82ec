//! In-process implementation of both backend seams.
//!
//! Every collection lives behind one mutex; listeners hang off per-key
//! [`Feed`]s and are always invoked after that mutex is released.  Watches
//! deliver the current snapshot synchronously, then every later snapshot.
//! A watch joins its feed while the snapshot is taken, so no write is lost
//! in between; a write racing a new subscription may be seen twice.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use agora_shared::{
    Channel, ChannelId, ConversationId, DirectMessage, DirectMessageConversation, Message,
    MessageRef, PresenceRecord, PresenceState, Reactions, Topic, TopicId, TypingIndicator, UserId,
};
use agora_shared::protocol::Document;

use super::{BackendError, DocumentBackend, Handler, PresenceBackend};
use crate::subscription::{lock, Feed, Subscription};

/// One [`Feed`] per key, created on first subscription.
struct Feeds<K, T: 'static> {
    feeds: Mutex<HashMap<K, Feed<T>>>,
}

impl<K: Eq + Hash + Clone, T: 'static> Feeds<K, T> {
    fn feed(&self, key: &K) -> Feed<T> {
        lock(&self.feeds).entry(key.clone()).or_default().clone()
    }

    fn publish(&self, key: &K, value: &T) {
        let feed = lock(&self.feeds).get(key).cloned();
        if let Some(feed) = feed {
            feed.publish(value);
        }
    }
}

/// Holds back feed values until the subscription's snapshot is delivered.
struct Gate<T, F> {
    /// Taken out while the snapshot is being delivered.
    deliver: Option<F>,
    primed: bool,
    pending: Option<T>,
}

/// Join `feed` with `deliver`.  Must be called while the collections lock
/// is held; pass the returned gate to [`open_gate`] once it is released.
fn attach<T, F>(feed: &Feed<T>, deliver: F) -> (Subscription, Arc<Mutex<Gate<T, F>>>)
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let gate = Arc::new(Mutex::new(Gate {
        deliver: Some(deliver),
        primed: false,
        pending: None,
    }));
    let live = Arc::clone(&gate);
    let subscription = feed.subscribe(move |value: &T| {
        let mut gate = lock(&live);
        if !gate.primed {
            gate.pending = Some(value.clone());
        } else if let Some(deliver) = gate.deliver.as_mut() {
            deliver(value.clone());
        }
    });
    (subscription, gate)
}

/// Deliver the snapshot, then anything published since [`attach`].
///
/// The gate is unlocked while `deliver` runs, so a handler may write to the
/// key it watches; that value is queued and delivered next.
fn open_gate<T, F: FnMut(T)>(gate: &Mutex<Gate<T, F>>, current: T) {
    let Some(mut deliver) = lock(gate).deliver.take() else {
        return;
    };
    deliver(current);
    loop {
        let mut guard = lock(gate);
        match guard.pending.take() {
            Some(value) => {
                drop(guard);
                deliver(value);
            }
            None => {
                guard.deliver = Some(deliver);
                guard.primed = true;
                return;
            }
        }
    }
}

impl<K, T: 'static> Default for Feeds<K, T> {
    fn default() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
        }
    }
}

/// Presence-store operation, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceOp {
    RegisterOnDisconnect(UserId, PresenceState),
    CancelOnDisconnect(UserId),
    Write(UserId, PresenceState),
    /// An on-disconnect action executed by the backend.
    Fired(UserId, PresenceState),
}

#[derive(Default)]
struct Collections {
    auth: Option<UserId>,
    channels: BTreeMap<ChannelId, Channel>,
    members: HashMap<ChannelId, BTreeSet<UserId>>,
    topics: HashMap<ChannelId, Vec<Topic>>,
    messages: HashMap<(ChannelId, TopicId), Vec<Message>>,
    conversations: BTreeMap<ConversationId, DirectMessageConversation>,
    direct_messages: HashMap<ConversationId, Vec<DirectMessage>>,
    typing: HashMap<String, BTreeMap<UserId, TypingIndicator>>,
    write_failure: Option<BackendError>,

    connected: bool,
    presence: HashMap<UserId, PresenceRecord>,
    on_disconnect: BTreeMap<UserId, PresenceState>,
    presence_log: Vec<PresenceOp>,
    presence_failure: Option<BackendError>,
    clock: Option<DateTime<Utc>>,
}

impl Collections {
    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn authorize_write(&self) -> Result<&UserId, BackendError> {
        if let Some(err) = &self.write_failure {
            return Err(err.clone());
        }
        self.auth.as_ref().ok_or(BackendError::Unauthenticated)
    }

    fn authorize_presence(&self) -> Result<(), BackendError> {
        match &self.presence_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn conversations_of(&self, user_id: &UserId) -> Vec<DirectMessageConversation> {
        let mut list: Vec<DirectMessageConversation> = self
            .conversations
            .values()
            .filter(|c| c.participants.contains(user_id))
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            let a_at = a.last_message_at.unwrap_or(a.created_at);
            let b_at = b.last_message_at.unwrap_or(b.created_at);
            b_at.cmp(&a_at).then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    fn typing_snapshot(&self, scope: &str) -> Vec<TypingIndicator> {
        self.typing
            .get(scope)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn channel_message_mut(
        &mut self,
        channel_id: &ChannelId,
        topic_id: &TopicId,
        message_id: &agora_shared::MessageId,
    ) -> Result<&mut Message, BackendError> {
        self.messages
            .get_mut(&(channel_id.clone(), topic_id.clone()))
            .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == message_id))
            .ok_or_else(|| BackendError::NotFound(format!("message {message_id}")))
    }

    fn direct_message_mut(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &agora_shared::MessageId,
    ) -> Result<&mut DirectMessage, BackendError> {
        self.direct_messages
            .get_mut(conversation_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == message_id))
            .ok_or_else(|| BackendError::NotFound(format!("message {message_id}")))
    }
}

#[derive(Default)]
struct Listeners {
    topics: Feeds<ChannelId, Vec<Topic>>,
    topic_messages: Feeds<(ChannelId, TopicId), Vec<Message>>,
    direct_messages: Feeds<ConversationId, Vec<DirectMessage>>,
    conversations: Feeds<UserId, Vec<DirectMessageConversation>>,
    typing: Feeds<String, Vec<TypingIndicator>>,
    presence: Feeds<UserId, Option<PresenceRecord>>,
    connectivity: Feed<bool>,
}

/// Snapshot to publish once the collections lock is released.
enum Change {
    Topics(ChannelId, Vec<Topic>),
    TopicMessages(ChannelId, TopicId, Vec<Message>),
    DirectMessages(ConversationId, Vec<DirectMessage>),
    Conversations(UserId, Vec<DirectMessageConversation>),
    Typing(String, Vec<TypingIndicator>),
    Presence(UserId, Option<PresenceRecord>),
}

/// Shared in-memory document and presence store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<Collections>>,
    listeners: Arc<Listeners>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate subsequent calls as `user_id`.
    pub fn sign_in_as(&self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        debug!(user = %user_id, "memory backend: signed in");
        lock(&self.data).auth = Some(user_id);
    }

    pub fn sign_out(&self) {
        lock(&self.data).auth = None;
    }

    /// Make every document write fail with `error` until cleared.
    pub fn fail_writes(&self, error: Option<BackendError>) {
        lock(&self.data).write_failure = error;
    }

    /// Make every presence-store write fail with `error` until cleared.
    pub fn fail_presence_writes(&self, error: Option<BackendError>) {
        lock(&self.data).presence_failure = error;
    }

    /// Pin the server clock.  `None` restores wall-clock time.
    pub fn set_server_time(&self, at: Option<DateTime<Utc>>) {
        lock(&self.data).clock = at;
    }

    /// Flip the connectivity signal.
    ///
    /// Going down executes every registered on-disconnect action, the way
    /// the realtime store does when a client socket drops.
    pub fn set_connected(&self, connected: bool) {
        let mut changes = Vec::new();
        {
            let mut data = lock(&self.data);
            if data.connected == connected {
                return;
            }
            data.connected = connected;
            if !connected {
                let now = data.now();
                for (user_id, state) in std::mem::take(&mut data.on_disconnect) {
                    let record = PresenceRecord {
                        state,
                        last_seen_at: now,
                    };
                    data.presence.insert(user_id.clone(), record);
                    data.presence_log.push(PresenceOp::Fired(user_id.clone(), state));
                    changes.push(Change::Presence(user_id, Some(record)));
                }
            }
        }
        debug!(connected, "memory backend: connectivity changed");
        self.listeners.connectivity.publish(&connected);
        self.publish(changes);
    }

    /// Decode a raw backend document and store it as the matching record.
    ///
    /// Used to seed the store from JSON fixtures; documents are validated
    /// exactly as they are when read from a hosted backend.
    pub async fn import_document(&self, value: serde_json::Value) -> Result<(), BackendError> {
        let document = Document::from_json(value)
            .map_err(|e| BackendError::InvalidDocument(e.to_string()))?;
        match document {
            Document::Channel(channel) => self.put_channel(channel).await,
            Document::Topic(topic) => self.put_topic(topic).await,
            Document::ChannelMessage(message) => self.add_message(message).await,
            Document::Conversation(conversation) => {
                self.ensure_conversation(conversation).await.map(|_| ())
            }
            Document::DirectMessage(message) => self.add_direct_message(message).await,
            Document::Presence { user_id, record } => {
                let change = {
                    let mut data = lock(&self.data);
                    data.presence.insert(user_id.clone(), record);
                    Change::Presence(user_id, Some(record))
                };
                self.publish(vec![change]);
                Ok(())
            }
        }
    }

    pub fn presence_log(&self) -> Vec<PresenceOp> {
        lock(&self.data).presence_log.clone()
    }

    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        lock(&self.data).presence.get(user_id).copied()
    }

    pub fn has_on_disconnect(&self, user_id: &UserId) -> bool {
        lock(&self.data).on_disconnect.contains_key(user_id)
    }

    /// Number of live listeners on a topic's message stream.
    pub fn topic_listener_count(&self, channel_id: &ChannelId, topic_id: &TopicId) -> usize {
        lock(&self.listeners.topic_messages.feeds)
            .get(&(channel_id.clone(), topic_id.clone()))
            .map_or(0, Feed::listener_count)
    }

    pub fn connectivity_listener_count(&self) -> usize {
        self.listeners.connectivity.listener_count()
    }

    pub fn presence_listener_count(&self, user_id: &UserId) -> usize {
        lock(&self.listeners.presence.feeds)
            .get(user_id)
            .map_or(0, Feed::listener_count)
    }

    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Topics(channel_id, topics) => {
                    self.listeners.topics.publish(&channel_id, &topics)
                }
                Change::TopicMessages(channel_id, topic_id, messages) => self
                    .listeners
                    .topic_messages
                    .publish(&(channel_id, topic_id), &messages),
                Change::DirectMessages(conversation_id, messages) => self
                    .listeners
                    .direct_messages
                    .publish(&conversation_id, &messages),
                Change::Conversations(user_id, conversations) => self
                    .listeners
                    .conversations
                    .publish(&user_id, &conversations),
                Change::Typing(scope, indicators) => {
                    self.listeners.typing.publish(&scope, &indicators)
                }
                Change::Presence(user_id, record) => {
                    self.listeners.presence.publish(&user_id, &record)
                }
            }
        }
    }

    /// Deliver `snapshot` (or a permission error when signed out) and attach
    /// `handler` to the feed for `key`.
    fn watch<K, T>(
        &self,
        feeds: &Feeds<K, T>,
        key: &K,
        path: String,
        snapshot: impl FnOnce(&Collections) -> T,
        mut handler: Handler<T>,
    ) -> Subscription
    where
        K: Eq + Hash + Clone,
        T: Clone + Send + 'static,
    {
        let (subscription, gate, current) = {
            let data = lock(&self.data);
            if data.auth.is_none() {
                drop(data);
                handler(Err(BackendError::PermissionDenied(path)));
                return Subscription::noop();
            }
            let (subscription, gate) =
                attach(&feeds.feed(key), move |value: T| handler(Ok(value)));
            (subscription, gate, snapshot(&*data))
        };
        open_gate(&gate, current);
        subscription
    }

    fn message_changes(&self, data: &Collections, target: &MessageRef) -> Vec<Change> {
        match target {
            MessageRef::Channel {
                channel_id,
                topic_id,
                ..
            } => {
                let key = (channel_id.clone(), topic_id.clone());
                let messages = data.messages.get(&key).cloned().unwrap_or_default();
                vec![Change::TopicMessages(
                    channel_id.clone(),
                    topic_id.clone(),
                    messages,
                )]
            }
            MessageRef::Direct {
                conversation_id, ..
            } => {
                let messages = data
                    .direct_messages
                    .get(conversation_id)
                    .cloned()
                    .unwrap_or_default();
                vec![Change::DirectMessages(conversation_id.clone(), messages)]
            }
        }
    }
}

impl DocumentBackend for MemoryBackend {
    fn watch_topics(&self, channel_id: &ChannelId, handler: Handler<Vec<Topic>>) -> Subscription {
        let id = channel_id.clone();
        self.watch(
            &self.listeners.topics,
            channel_id,
            format!("channels/{channel_id}/topics"),
            move |data| data.topics.get(&id).cloned().unwrap_or_default(),
            handler,
        )
    }

    fn watch_topic_messages(
        &self,
        channel_id: &ChannelId,
        topic: &Topic,
        handler: Handler<Vec<Message>>,
    ) -> Subscription {
        let key = (channel_id.clone(), topic.id.clone());
        let lookup = key.clone();
        self.watch(
            &self.listeners.topic_messages,
            &key,
            format!("channels/{channel_id}/topics/{}/messages", topic.id),
            move |data| data.messages.get(&lookup).cloned().unwrap_or_default(),
            handler,
        )
    }

    fn watch_direct_messages(
        &self,
        conversation_id: &ConversationId,
        handler: Handler<Vec<DirectMessage>>,
    ) -> Subscription {
        let id = conversation_id.clone();
        self.watch(
            &self.listeners.direct_messages,
            conversation_id,
            format!("conversations/{conversation_id}/messages"),
            move |data| data.direct_messages.get(&id).cloned().unwrap_or_default(),
            handler,
        )
    }

    fn watch_conversations(
        &self,
        user_id: &UserId,
        handler: Handler<Vec<DirectMessageConversation>>,
    ) -> Subscription {
        let id = user_id.clone();
        self.watch(
            &self.listeners.conversations,
            user_id,
            "conversations".to_string(),
            move |data| data.conversations_of(&id),
            handler,
        )
    }

    fn watch_typing(&self, scope: &str, handler: Handler<Vec<TypingIndicator>>) -> Subscription {
        let key = scope.to_string();
        let lookup = key.clone();
        self.watch(
            &self.listeners.typing,
            &key,
            format!("typing/{scope}"),
            move |data| data.typing_snapshot(&lookup),
            handler,
        )
    }

    async fn put_channel(&self, channel: Channel) -> Result<(), BackendError> {
        let mut data = lock(&self.data);
        data.authorize_write()?;
        data.channels.insert(channel.id.clone(), channel);
        Ok(())
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, BackendError> {
        let data = lock(&self.data);
        if data.auth.is_none() {
            return Err(BackendError::PermissionDenied(format!("channels/{channel_id}")));
        }
        data.channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("channel {channel_id}")))
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, BackendError> {
        let data = lock(&self.data);
        if data.auth.is_none() {
            return Err(BackendError::PermissionDenied("channels".to_string()));
        }
        Ok(data.channels.values().cloned().collect())
    }

    async fn delete_channel(&self, channel_id: &ChannelId) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            if data.channels.remove(channel_id).is_none() {
                return Err(BackendError::NotFound(format!("channel {channel_id}")));
            }
            data.members.remove(channel_id);
            let topics = data.topics.remove(channel_id).unwrap_or_default();
            let mut changes = Vec::with_capacity(topics.len() + 1);
            for topic in topics {
                data.messages.remove(&(channel_id.clone(), topic.id.clone()));
                changes.push(Change::TopicMessages(channel_id.clone(), topic.id, Vec::new()));
            }
            changes.push(Change::Topics(channel_id.clone(), Vec::new()));
            changes
        };
        self.publish(changes);
        Ok(())
    }

    async fn add_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<(), BackendError> {
        let mut data = lock(&self.data);
        data.authorize_write()?;
        if !data.channels.contains_key(channel_id) {
            return Err(BackendError::NotFound(format!("channel {channel_id}")));
        }
        data.members
            .entry(channel_id.clone())
            .or_default()
            .insert(user_id.clone());
        Ok(())
    }

    async fn remove_member(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<(), BackendError> {
        let mut data = lock(&self.data);
        data.authorize_write()?;
        if let Some(members) = data.members.get_mut(channel_id) {
            members.remove(user_id);
        }
        Ok(())
    }

    async fn list_members(&self, channel_id: &ChannelId) -> Result<BTreeSet<UserId>, BackendError> {
        let data = lock(&self.data);
        if data.auth.is_none() {
            return Err(BackendError::PermissionDenied(format!(
                "channels/{channel_id}/members"
            )));
        }
        Ok(data.members.get(channel_id).cloned().unwrap_or_default())
    }

    async fn put_topic(&self, topic: Topic) -> Result<(), BackendError> {
        let change = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            if !data.channels.contains_key(&topic.channel_id) {
                return Err(BackendError::NotFound(format!("channel {}", topic.channel_id)));
            }
            let channel_id = topic.channel_id.clone();
            let topics = data.topics.entry(channel_id.clone()).or_default();
            match topics.iter_mut().find(|t| t.id == topic.id) {
                Some(existing) => *existing = topic,
                None => topics.push(topic),
            }
            Change::Topics(channel_id, topics.clone())
        };
        self.publish(vec![change]);
        Ok(())
    }

    async fn add_message(&self, message: Message) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            let channel_id = message.channel_id.clone();
            let topic_id = message.topic_id.clone();
            let timestamp = message.timestamp;

            let topics = data
                .topics
                .get_mut(&channel_id)
                .ok_or_else(|| BackendError::NotFound(format!("channel {channel_id}")))?;
            let topic = topics
                .iter_mut()
                .find(|t| t.id == topic_id)
                .ok_or_else(|| BackendError::NotFound(format!("topic {topic_id}")))?;
            topic.last_message_at = Some(topic.last_message_at.map_or(timestamp, |t| t.max(timestamp)));
            let topics = topics.clone();

            let messages = data
                .messages
                .entry((channel_id.clone(), topic_id.clone()))
                .or_default();
            let pos = messages.partition_point(|m| m.timestamp <= timestamp);
            messages.insert(pos, message);
            let messages = messages.clone();

            vec![
                Change::TopicMessages(channel_id.clone(), topic_id, messages),
                Change::Topics(channel_id, topics),
            ]
        };
        self.publish(changes);
        Ok(())
    }

    async fn get_reactions(&self, target: &MessageRef) -> Result<Reactions, BackendError> {
        let mut data = lock(&self.data);
        if data.auth.is_none() {
            return Err(BackendError::PermissionDenied(format!(
                "messages/{}",
                target.message_id()
            )));
        }
        let reactions = match target {
            MessageRef::Channel {
                channel_id,
                topic_id,
                message_id,
            } => data
                .channel_message_mut(channel_id, topic_id, message_id)?
                .reactions
                .clone(),
            MessageRef::Direct {
                conversation_id,
                message_id,
            } => data
                .direct_message_mut(conversation_id, message_id)?
                .reactions
                .clone(),
        };
        Ok(reactions)
    }

    async fn set_reactions(
        &self,
        target: &MessageRef,
        reactions: Reactions,
    ) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            match target {
                MessageRef::Channel {
                    channel_id,
                    topic_id,
                    message_id,
                } => {
                    data.channel_message_mut(channel_id, topic_id, message_id)?
                        .reactions = reactions
                }
                MessageRef::Direct {
                    conversation_id,
                    message_id,
                } => {
                    data.direct_message_mut(conversation_id, message_id)?
                        .reactions = reactions
                }
            }
            self.message_changes(&data, target)
        };
        self.publish(changes);
        Ok(())
    }

    async fn edit_message(&self, target: &MessageRef, text: String) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            let now = data.now();
            match target {
                MessageRef::Channel {
                    channel_id,
                    topic_id,
                    message_id,
                } => {
                    let message = data.channel_message_mut(channel_id, topic_id, message_id)?;
                    message.text = text;
                    message.edited_at = Some(now);
                }
                MessageRef::Direct {
                    conversation_id,
                    message_id,
                } => data.direct_message_mut(conversation_id, message_id)?.text = text,
            }
            self.message_changes(&data, target)
        };
        self.publish(changes);
        Ok(())
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            let message_id = target.message_id();
            let removed = match target {
                MessageRef::Channel {
                    channel_id,
                    topic_id,
                    ..
                } => data
                    .messages
                    .get_mut(&(channel_id.clone(), topic_id.clone()))
                    .map(|msgs| {
                        let before = msgs.len();
                        msgs.retain(|m| &m.id != message_id);
                        before != msgs.len()
                    }),
                MessageRef::Direct {
                    conversation_id, ..
                } => data.direct_messages.get_mut(conversation_id).map(|msgs| {
                    let before = msgs.len();
                    msgs.retain(|m| &m.id != message_id);
                    before != msgs.len()
                }),
            };
            if removed != Some(true) {
                return Err(BackendError::NotFound(format!("message {message_id}")));
            }
            self.message_changes(&data, target)
        };
        self.publish(changes);
        Ok(())
    }

    async fn ensure_conversation(
        &self,
        conversation: DirectMessageConversation,
    ) -> Result<DirectMessageConversation, BackendError> {
        let (stored, changes) = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            if let Some(existing) = data.conversations.get(&conversation.id) {
                return Ok(existing.clone());
            }
            data.conversations
                .insert(conversation.id.clone(), conversation.clone());
            let changes = conversation
                .participants
                .iter()
                .map(|p| Change::Conversations(p.clone(), data.conversations_of(p)))
                .collect();
            (conversation, changes)
        };
        self.publish(changes);
        Ok(stored)
    }

    async fn add_direct_message(&self, message: DirectMessage) -> Result<(), BackendError> {
        let changes = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            let conversation_id = message.conversation_id.clone();
            let timestamp = message.timestamp;
            let conversation = data
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| BackendError::NotFound(format!("conversation {conversation_id}")))?;
            conversation.last_message_at = Some(
                conversation
                    .last_message_at
                    .map_or(timestamp, |t| t.max(timestamp)),
            );
            let participants = conversation.participants.clone();

            let messages = data
                .direct_messages
                .entry(conversation_id.clone())
                .or_default();
            let pos = messages.partition_point(|m| m.timestamp <= timestamp);
            messages.insert(pos, message);
            let messages = messages.clone();

            let mut changes = vec![Change::DirectMessages(conversation_id, messages)];
            for p in participants {
                let list = data.conversations_of(&p);
                changes.push(Change::Conversations(p, list));
            }
            changes
        };
        self.publish(changes);
        Ok(())
    }

    async fn set_typing(&self, scope: &str, indicator: TypingIndicator) -> Result<(), BackendError> {
        let change = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            data.typing
                .entry(scope.to_string())
                .or_default()
                .insert(indicator.user_id.clone(), indicator);
            Change::Typing(scope.to_string(), data.typing_snapshot(scope))
        };
        self.publish(vec![change]);
        Ok(())
    }

    async fn clear_typing(&self, scope: &str, user_id: &UserId) -> Result<(), BackendError> {
        let change = {
            let mut data = lock(&self.data);
            data.authorize_write()?;
            let removed = data
                .typing
                .get_mut(scope)
                .and_then(|m| m.remove(user_id))
                .is_some();
            if !removed {
                return Ok(());
            }
            Change::Typing(scope.to_string(), data.typing_snapshot(scope))
        };
        self.publish(vec![change]);
        Ok(())
    }
}

impl PresenceBackend for MemoryBackend {
    fn watch_connectivity(&self, handler: Box<dyn FnMut(bool) + Send>) -> Subscription {
        let (subscription, gate, connected) = {
            let data = lock(&self.data);
            let (subscription, gate) = attach(&self.listeners.connectivity, handler);
            (subscription, gate, data.connected)
        };
        open_gate(&gate, connected);
        subscription
    }

    fn watch_presence(
        &self,
        user_id: &UserId,
        handler: Box<dyn FnMut(Option<PresenceRecord>) + Send>,
    ) -> Subscription {
        let (subscription, gate, current) = {
            let data = lock(&self.data);
            let (subscription, gate) = attach(&self.listeners.presence.feed(user_id), handler);
            (subscription, gate, data.presence.get(user_id).copied())
        };
        open_gate(&gate, current);
        subscription
    }

    async fn register_on_disconnect(
        &self,
        user_id: &UserId,
        state: PresenceState,
    ) -> Result<(), BackendError> {
        let mut data = lock(&self.data);
        data.authorize_presence()?;
        data.on_disconnect.insert(user_id.clone(), state);
        data.presence_log
            .push(PresenceOp::RegisterOnDisconnect(user_id.clone(), state));
        Ok(())
    }

    async fn cancel_on_disconnect(&self, user_id: &UserId) -> Result<(), BackendError> {
        let mut data = lock(&self.data);
        data.authorize_presence()?;
        data.on_disconnect.remove(user_id);
        data.presence_log
            .push(PresenceOp::CancelOnDisconnect(user_id.clone()));
        Ok(())
    }

    async fn write_presence(
        &self,
        user_id: &UserId,
        state: PresenceState,
    ) -> Result<(), BackendError> {
        let record = {
            let mut data = lock(&self.data);
            data.authorize_presence()?;
            let record = PresenceRecord {
                state,
                last_seen_at: data.now(),
            };
            data.presence.insert(user_id.clone(), record);
            data.presence_log.push(PresenceOp::Write(user_id.clone(), state));
            record
        };
        self.publish(vec![Change::Presence(user_id.clone(), Some(record))]);
        Ok(())
    }
}
