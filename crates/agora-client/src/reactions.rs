//! Reacting to messages.
//!
//! Both entry points read the message's current reaction map, apply the
//! single-reaction-per-user reducer and write the whole map back.  The
//! backend resolves concurrent writers last-write-wins.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use agora_shared::{MessageRef, ReactionChange, Reactions, UserId};
use agora_store::EmojiUsage;

use crate::backend::DocumentBackend;
use crate::error::Result;
use crate::state::SharedDatabase;
use crate::subscription::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gesture {
    /// Emoji picker: always ends with the user holding the emoji.
    Select,
    /// Clicking an existing reaction chip: toggles it off if already held.
    Click,
}

pub struct ReactionService<B: DocumentBackend> {
    backend: Arc<B>,
    db: SharedDatabase,
}

impl<B: DocumentBackend> ReactionService<B> {
    pub fn new(backend: Arc<B>, db: SharedDatabase) -> Self {
        Self { backend, db }
    }

    /// React with `emoji` from the picker, replacing any other reaction the
    /// user holds on the message.  Selecting the held emoji again is a
    /// no-op.
    pub async fn select_emoji(
        &self,
        target: &MessageRef,
        user: &UserId,
        emoji: &str,
    ) -> Result<ReactionChange> {
        self.react(target, user, emoji, Gesture::Select).await
    }

    /// Toggle `emoji` from its reaction chip: removes it if the user holds
    /// it, otherwise behaves like [`select_emoji`](Self::select_emoji).
    pub async fn reaction_clicked(
        &self,
        target: &MessageRef,
        user: &UserId,
        emoji: &str,
    ) -> Result<ReactionChange> {
        self.react(target, user, emoji, Gesture::Click).await
    }

    /// Locally most used emojis, for the quick-reaction bar.
    pub fn frequent_emojis(&self, limit: usize) -> Result<Vec<EmojiUsage>> {
        Ok(lock(&self.db).frequent_emojis(limit)?)
    }

    async fn react(
        &self,
        target: &MessageRef,
        user: &UserId,
        emoji: &str,
        gesture: Gesture,
    ) -> Result<ReactionChange> {
        let message_id = target.message_id();

        let mut reactions: Reactions = match self.backend.get_reactions(target).await {
            Ok(r) => r,
            Err(e) => {
                error!(message = %message_id, error = %e, "failed to read reactions");
                return Err(e.into());
            }
        };

        let change = match gesture {
            Gesture::Select => reactions.apply(user, emoji),
            Gesture::Click => reactions.toggle(user, emoji),
        };

        if let ReactionChange::Unchanged { .. } = change {
            debug!(message = %message_id, user = %user, emoji, "reaction unchanged");
            return Ok(change);
        }

        if let Err(e) = self.backend.set_reactions(target, reactions).await {
            error!(message = %message_id, user = %user, emoji, error = %e, "failed to update reactions");
            return Err(e.into());
        }
        debug!(message = %message_id, user = %user, ?change, "reaction updated");

        if !matches!(change, ReactionChange::Removed { .. }) {
            if let Err(e) = lock(&self.db).record_emoji_use(emoji, Utc::now()) {
                warn!(emoji, error = %e, "failed to record emoji usage");
            }
        }

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use agora_shared::{Channel, Message, Topic};
    use agora_store::Database;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::BackendError;
    use crate::error::ClientError;

    async fn seeded() -> (Arc<MemoryBackend>, MessageRef) {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in_as("alice");
        let at = Utc.timestamp_opt(0, 0).unwrap();
        backend
            .put_channel(Channel {
                id: "c1".into(),
                name: "c1".into(),
                description: String::new(),
                owner_id: "alice".into(),
                created_at: at,
                updated_at: at,
            })
            .await
            .unwrap();
        backend
            .put_topic(Topic {
                id: "t1".into(),
                channel_id: "c1".into(),
                name: "general".into(),
                last_message_at: None,
            })
            .await
            .unwrap();
        let message = Message {
            id: "m1".into(),
            text: "hello".into(),
            sender_id: "alice".into(),
            timestamp: at,
            topic_id: "t1".into(),
            channel_id: "c1".into(),
            parent_message_id: None,
            reactions: Reactions::new(),
            thread_count: 0,
            edited_at: None,
        };
        let target = MessageRef::from(&message);
        backend.add_message(message).await.unwrap();
        (backend, target)
    }

    fn service(backend: Arc<MemoryBackend>) -> ReactionService<MemoryBackend> {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        ReactionService::new(backend, db)
    }

    #[tokio::test]
    async fn switching_keeps_one_reaction_per_user() {
        let (backend, target) = seeded().await;
        let svc = service(backend.clone());
        let bob: UserId = "bob".into();

        svc.select_emoji(&target, &bob, "👍").await.unwrap();
        let change = svc.select_emoji(&target, &bob, "🎉").await.unwrap();
        assert_eq!(
            change,
            ReactionChange::Switched {
                from: "👍".into(),
                to: "🎉".into()
            }
        );

        let stored = backend.get_reactions(&target).await.unwrap();
        assert!(stored.get("👍").is_none());
        assert_eq!(stored.get("🎉").unwrap().count, 1);
        assert_eq!(stored.held_by(&bob), Some("🎉"));
    }

    #[tokio::test]
    async fn picker_is_idempotent_and_click_toggles_off() {
        let (backend, target) = seeded().await;
        let svc = service(backend.clone());
        let bob: UserId = "bob".into();

        svc.select_emoji(&target, &bob, "👍").await.unwrap();
        let again = svc.select_emoji(&target, &bob, "👍").await.unwrap();
        assert_eq!(again, ReactionChange::Unchanged { emoji: "👍".into() });
        assert_eq!(backend.get_reactions(&target).await.unwrap().total(), 1);

        let off = svc.reaction_clicked(&target, &bob, "👍").await.unwrap();
        assert_eq!(off, ReactionChange::Removed { emoji: "👍".into() });
        assert!(backend.get_reactions(&target).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usage_is_recorded_for_added_reactions() {
        let (backend, target) = seeded().await;
        let svc = service(backend);
        svc.select_emoji(&target, &"bob".into(), "🔥").await.unwrap();
        svc.select_emoji(&target, &"carol".into(), "🔥").await.unwrap();
        svc.reaction_clicked(&target, &"carol".into(), "🔥").await.unwrap();

        let top = svc.frequent_emojis(5).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].use_count, 2);
    }

    #[tokio::test]
    async fn write_failures_are_returned() {
        let (backend, target) = seeded().await;
        let svc = service(backend.clone());
        backend.fail_writes(Some(BackendError::PermissionDenied("reactions".into())));

        let err = svc
            .select_emoji(&target, &"bob".into(), "👍")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Backend(BackendError::PermissionDenied(_))
        ));
        assert!(svc.frequent_emojis(5).unwrap().is_empty());
    }
}
