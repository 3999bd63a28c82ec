//! Session-level facade wiring the client services to [`AppState`] and the
//! event channel.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use agora_shared::{AuthError, ChannelId, DirectMessageConversation, Locale, MessageId, UserId};

use crate::avatar::AvatarUploader;
use crate::backend::{DocumentBackend, PresenceBackend};
use crate::chat::ChatService;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, Action, ClientEvent, EventSender};
use crate::presence::{PresenceCache, PresenceTracker};
use crate::reactions::ReactionService;
use crate::state::SharedState;
use crate::subscription::{lock, Subscription};
use crate::timeline::{ChannelTimeline, TimelineView};
use crate::unread::{watch_unread, UnreadTracker};

struct Session {
    user_id: UserId,
    unread: Arc<Mutex<UnreadTracker>>,
    unread_sub: Subscription,
    status_forwarder: JoinHandle<()>,
}

/// One signed-in client: chat operations, reactions, presence, unread
/// counters and avatars over a single backend.
pub struct AgoraClient<B: DocumentBackend + PresenceBackend> {
    backend: Arc<B>,
    state: SharedState,
    events: EventSender,
    locale: Locale,
    chat: ChatService<B>,
    reactions: ReactionService<B>,
    presence: PresenceTracker<B>,
    presence_cache: PresenceCache<B>,
    avatars: AvatarUploader,
    session: Mutex<Option<Session>>,
}

impl<B: DocumentBackend + PresenceBackend> AgoraClient<B> {
    pub fn new(backend: Arc<B>, state: SharedState, events: EventSender) -> Result<Self> {
        let (db, typing_ttl, upload_url) = {
            let state = lock(&state);
            (
                Arc::clone(&state.database),
                state.config.typing_ttl(),
                state.config.avatar_upload_url.clone(),
            )
        };

        Ok(Self {
            chat: ChatService::new(Arc::clone(&backend), typing_ttl),
            reactions: ReactionService::new(Arc::clone(&backend), Arc::clone(&db)),
            presence: PresenceTracker::new(Arc::clone(&backend)),
            presence_cache: PresenceCache::new(Arc::clone(&backend)),
            avatars: AvatarUploader::new(upload_url, db)?,
            backend,
            state,
            events,
            locale: Locale::default(),
            session: Mutex::new(None),
        })
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    pub fn chat(&self) -> &ChatService<B> {
        &self.chat
    }

    pub fn reactions(&self) -> &ReactionService<B> {
        &self.reactions
    }

    pub fn presence(&self) -> &PresenceTracker<B> {
        &self.presence
    }

    pub fn avatars(&self) -> &AvatarUploader {
        &self.avatars
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.session).as_ref().map(|s| s.user_id.clone())
    }

    /// Start a session for `user_id` once the auth provider has accepted
    /// the credentials.  Replaces any previous session.
    pub fn sign_in(&self, user_id: UserId) -> Result<()> {
        self.end_session();

        let db = Arc::clone(&lock(&self.state).database);
        let unread = Arc::new(Mutex::new(UnreadTracker::load(db, user_id.clone())?));

        let events = self.events.clone();
        let unread_sub = watch_unread(&self.backend, Arc::clone(&unread), move |counts, total| {
            emit_event(&events, ClientEvent::UnreadChanged { counts, total });
        });

        let mut status = self.presence.watch_status();
        let events = self.events.clone();
        let status_forwarder = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                emit_event(&events, ClientEvent::OwnPresenceChanged { status: current });
            }
        });

        self.presence.on_login(user_id.clone());
        lock(&self.state).current_user = Some(user_id.clone());
        *lock(&self.session) = Some(Session {
            user_id: user_id.clone(),
            unread,
            unread_sub,
            status_forwarder,
        });
        info!(user = %user_id, "session started");
        Ok(())
    }

    /// Report a sign-in rejected by the auth provider.  The raw code is
    /// logged; the view layer only receives the localised message.
    pub fn sign_in_failed(&self, code: &str) -> ClientError {
        let err = ClientError::from(AuthError::from_code(code));
        warn!(code, "sign-in rejected");
        self.report(&err);
        err
    }

    /// Explicit sign-out: presence goes offline before the session ends.
    pub async fn sign_out(&self) {
        self.presence.sign_out().await;
        self.end_session();
    }

    fn end_session(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.unread_sub.unsubscribe();
            session.status_forwarder.abort();
            // After an explicit sign-out the tracker is already stopped and
            // keeps reporting `Offline`.
            if self.presence.current_user().is_some() {
                self.presence.on_logout();
            }
            info!(user = %session.user_id, "session ended");
        }
        lock(&self.state).clear_session();
    }

    fn session_parts(&self) -> Result<(UserId, Arc<Mutex<UnreadTracker>>)> {
        lock(&self.session)
            .as_ref()
            .map(|s| (s.user_id.clone(), Arc::clone(&s.unread)))
            .ok_or(ClientError::NotSignedIn)
    }

    /// Open (creating if needed) the conversation with `peer` and clear its
    /// unread counter.
    pub async fn open_conversation(&self, peer: &UserId) -> Result<DirectMessageConversation> {
        let (me, unread) = self.session_parts()?;
        let conversation = self.chat.open_conversation(&me, peer).await?;

        let (counts, total) = {
            let mut tracker = lock(&unread);
            tracker.open_conversation(peer);
            (tracker.counts(), tracker.total())
        };
        {
            let mut state = lock(&self.state);
            state.active_conversation = Some(conversation.id.clone());
            state.active_peer = Some(peer.clone());
        }
        emit_event(&self.events, ClientEvent::UnreadChanged { counts, total });
        Ok(conversation)
    }

    pub fn close_conversation(&self) {
        if let Ok((_, unread)) = self.session_parts() {
            lock(&unread).set_active_peer(None);
        }
        let mut state = lock(&self.state);
        state.active_conversation = None;
        state.active_peer = None;
    }

    pub fn unread_total(&self) -> u32 {
        self.session_parts()
            .map(|(_, unread)| lock(&unread).total())
            .unwrap_or(0)
    }

    /// Publish the channel's root timeline as [`ClientEvent::TimelineUpdated`].
    pub fn watch_channel(&self, channel_id: &ChannelId) -> Subscription {
        let events = self.events.clone();
        let id = channel_id.clone();
        let locale = self.locale;
        ChannelTimeline::watch(&self.backend, channel_id, TimelineView::Channel, move |result| {
            match result {
                Ok(messages) => emit_event(
                    &events,
                    ClientEvent::TimelineUpdated {
                        channel_id: id.clone(),
                        messages,
                    },
                ),
                Err(e) => emit_event(
                    &events,
                    ClientEvent::Error {
                        message: ClientError::from(e).user_message(locale),
                    },
                ),
            }
        })
    }

    /// Publish the replies to `parent` as [`ClientEvent::ThreadUpdated`].
    pub fn watch_thread(&self, channel_id: &ChannelId, parent: &MessageId) -> Subscription {
        let events = self.events.clone();
        let id = channel_id.clone();
        let parent_id = parent.clone();
        let locale = self.locale;
        ChannelTimeline::watch(
            &self.backend,
            channel_id,
            TimelineView::Thread(parent.clone()),
            move |result| match result {
                Ok(replies) => emit_event(
                    &events,
                    ClientEvent::ThreadUpdated {
                        channel_id: id.clone(),
                        parent_id: parent_id.clone(),
                        replies,
                    },
                ),
                Err(e) => emit_event(
                    &events,
                    ClientEvent::Error {
                        message: ClientError::from(e).user_message(locale),
                    },
                ),
            },
        )
    }

    /// Publish `user_id`'s presence as [`ClientEvent::PresenceChanged`].
    pub fn watch_presence(&self, user_id: &UserId) -> Subscription {
        let events = self.events.clone();
        let id = user_id.clone();
        self.presence_cache.subscribe(user_id, move |record| {
            emit_event(
                &events,
                ClientEvent::PresenceChanged {
                    user_id: id.clone(),
                    record,
                },
            )
        })
    }

    /// Publish who else is typing in `scope` as [`ClientEvent::TypingChanged`].
    pub fn watch_typing(&self, scope: &str) -> Result<Subscription> {
        let (me, _) = self.session_parts()?;
        let events = self.events.clone();
        let key = scope.to_string();
        Ok(self.chat.watch_typing(scope, &me, move |result| {
            if let Ok(users) = result {
                emit_event(
                    &events,
                    ClientEvent::TypingChanged {
                        scope: key.clone(),
                        users,
                    },
                );
            }
        }))
    }

    /// Execute a view-layer request.  Failures are reported to the view
    /// layer as a localised [`ClientEvent::Error`] and returned.
    pub async fn handle(&self, action: Action) -> Result<()> {
        let result = self.dispatch(action).await;
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    async fn dispatch(&self, action: Action) -> Result<()> {
        match action {
            Action::SelectChannel {
                channel_id,
                topic_id,
            } => {
                lock(&self.state).select_channel(channel_id, topic_id);
                Ok(())
            }
            Action::OpenThread(parent) => {
                lock(&self.state).open_thread = Some(parent);
                Ok(())
            }
            Action::CloseThread => {
                lock(&self.state).open_thread = None;
                Ok(())
            }
            Action::OpenConversation(peer) => self.open_conversation(&peer).await.map(|_| ()),
            Action::SendMessage {
                channel_id,
                topic_id,
                text,
                parent,
            } => {
                let (me, _) = self.session_parts()?;
                self.chat
                    .send_message(&channel_id, &topic_id, &me, &text, parent)
                    .await
                    .map(|_| ())
            }
            Action::SendDirectMessage {
                conversation_id,
                text,
            } => {
                let (me, _) = self.session_parts()?;
                self.chat
                    .send_direct_message(&conversation_id, &me, &text)
                    .await
                    .map(|_| ())
            }
            Action::React { target, emoji } => {
                let (me, _) = self.session_parts()?;
                self.reactions
                    .reaction_clicked(&target, &me, &emoji)
                    .await
                    .map(|_| ())
            }
            Action::SignOut => {
                self.sign_out().await;
                Ok(())
            }
        }
    }

    fn report(&self, err: &ClientError) {
        emit_event(
            &self.events,
            ClientEvent::Error {
                message: err.user_message(self.locale),
            },
        );
    }
}
