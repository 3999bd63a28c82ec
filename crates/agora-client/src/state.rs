//! Application state shared between the view layer and the client services.
//!
//! The [`AppState`] struct is wrapped in `Arc<Mutex<>>` and handed to every
//! component that needs the session context, replacing process-wide
//! globals.

use std::sync::{Arc, Mutex};

use agora_shared::{ChannelId, ConversationId, MessageId, TopicId, UserId};
use agora_store::Database;

use crate::config::ClientConfig;

/// Local database handle shared by the unread tracker, reaction service
/// and avatar uploader.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Shared handle to the application state.
pub type SharedState = Arc<Mutex<AppState>>;

/// Central application state.
///
/// Holds the signed-in user, the current navigation context and the local
/// database handle.
pub struct AppState {
    pub config: ClientConfig,

    /// `None` until sign-in completes.
    pub current_user: Option<UserId>,

    /// Channel and topic shown in the main timeline.
    pub selected_channel: Option<ChannelId>,
    pub selected_topic: Option<TopicId>,

    /// Root message whose thread panel is open.
    pub open_thread: Option<MessageId>,

    /// Direct conversation currently on screen, and its other participant.
    pub active_conversation: Option<ConversationId>,
    pub active_peer: Option<UserId>,

    pub database: SharedDatabase,
}

impl AppState {
    pub fn new(config: ClientConfig, database: Database) -> Self {
        Self {
            config,
            current_user: None,
            selected_channel: None,
            selected_topic: None,
            open_thread: None,
            active_conversation: None,
            active_peer: None,
            database: Arc::new(Mutex::new(database)),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Switch the main timeline to `channel_id`, closing any open thread.
    pub fn select_channel(&mut self, channel_id: ChannelId, topic_id: Option<TopicId>) {
        self.selected_channel = Some(channel_id);
        self.selected_topic = topic_id;
        self.open_thread = None;
    }

    /// Forget everything tied to the signed-in user.
    pub fn clear_session(&mut self) {
        self.current_user = None;
        self.selected_channel = None;
        self.selected_topic = None;
        self.open_thread = None;
        self.active_conversation = None;
        self.active_peer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selecting_a_channel_closes_the_thread() {
        let db = Database::open_in_memory().unwrap();
        let mut state = AppState::new(ClientConfig::default(), db);
        state.open_thread = Some("m1".into());

        state.select_channel("c1".into(), None);
        assert_eq!(state.selected_channel, Some("c1".into()));
        assert!(state.open_thread.is_none());

        state.current_user = Some("alice".into());
        state.clear_session();
        assert!(state.current_user.is_none());
        assert!(state.selected_channel.is_none());
    }
}
