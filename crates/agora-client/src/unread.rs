//! Unread direct-message counters.
//!
//! Counters are derived from message-count deltas per conversation peer and
//! persisted together with the last observed counts, so a restart neither
//! loses nor double-counts unread messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use agora_shared::{ConversationId, DirectMessage, DirectMessageConversation, UserId};

use crate::backend::{tolerate_permission_errors, BackendError, DocumentBackend};
use crate::error::Result;
use crate::state::SharedDatabase;
use crate::subscription::{lock, Subscription};

pub struct UnreadTracker {
    db: SharedDatabase,
    me: UserId,
    active_peer: Option<UserId>,
    unread: HashMap<UserId, u32>,
    last_counts: HashMap<UserId, usize>,
}

impl UnreadTracker {
    /// Restore persisted counters for `me`.
    pub fn load(db: SharedDatabase, me: UserId) -> Result<Self> {
        let (unread, last_counts) = {
            let db = lock(&db);
            (
                db.load_unread_counts(me.as_str())?,
                db.load_message_counts(me.as_str())?,
            )
        };
        debug!(user = %me, peers = unread.len(), "unread counters restored");
        Ok(Self {
            db,
            me,
            active_peer: None,
            unread: unread.into_iter().map(|(k, v)| (UserId::new(k), v)).collect(),
            last_counts: last_counts
                .into_iter()
                .map(|(k, v)| (UserId::new(k), v))
                .collect(),
        })
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn active_peer(&self) -> Option<&UserId> {
        self.active_peer.as_ref()
    }

    /// Mark `peer`'s conversation as on screen (or none) without clearing
    /// anything.
    pub fn set_active_peer(&mut self, peer: Option<UserId>) {
        self.active_peer = peer;
    }

    /// Record that the conversation with `peer` now holds `count` messages,
    /// the newest sent by `newest_sender`.  Returns the peer's unread count.
    ///
    /// The first count seen for a peer is only a baseline; use
    /// [`observe_conversation`](Self::observe_conversation) when the
    /// messages themselves are available.
    pub fn observe(&mut self, peer: &UserId, count: usize, newest_sender: Option<&UserId>) -> u32 {
        let previous = self.last_counts.insert(peer.clone(), count);
        if previous != Some(count) {
            self.persist_count(peer, count);
        }

        match previous {
            Some(prev) if count > prev => {
                if newest_sender != Some(&self.me) {
                    self.add_unread(peer, count - prev);
                }
            }
            None => debug!(peer = %peer, count, "unread baseline recorded"),
            _ => {}
        }

        self.unread(peer)
    }

    /// [`observe`](Self::observe) a full message snapshot.
    ///
    /// A conversation with no stored baseline was never seen by this user
    /// on this device: every message from the peer in it counts as unread.
    pub fn observe_conversation(&mut self, peer: &UserId, messages: &[DirectMessage]) -> u32 {
        if self.last_counts.contains_key(peer) {
            let newest = messages.last().map(|m| &m.sender_id);
            return self.observe(peer, messages.len(), newest);
        }

        self.last_counts.insert(peer.clone(), messages.len());
        self.persist_count(peer, messages.len());
        let unseen = messages.iter().filter(|m| m.sender_id != self.me).count();
        debug!(peer = %peer, count = messages.len(), unseen, "conversation discovered");
        self.add_unread(peer, unseen);
        self.unread(peer)
    }

    fn add_unread(&mut self, peer: &UserId, delta: usize) {
        if delta == 0 || self.active_peer.as_ref() == Some(peer) {
            return;
        }
        let delta = u32::try_from(delta).unwrap_or(u32::MAX);
        let entry = self.unread.entry(peer.clone()).or_insert(0);
        *entry = entry.saturating_add(delta);
        let unread = *entry;
        debug!(peer = %peer, delta, unread, "new unread messages");
        self.persist_unread(peer, unread);
    }

    /// Make `peer` the active conversation and clear its counter.
    pub fn open_conversation(&mut self, peer: &UserId) {
        self.active_peer = Some(peer.clone());
        if self.unread.remove(peer).is_some() {
            self.persist_unread(peer, 0);
        }
    }

    pub fn unread(&self, peer: &UserId) -> u32 {
        self.unread.get(peer).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.unread.values().fold(0u32, |acc, n| acc.saturating_add(*n))
    }

    pub fn counts(&self) -> HashMap<UserId, u32> {
        self.unread.clone()
    }

    fn persist_unread(&self, peer: &UserId, count: u32) {
        if let Err(e) = lock(&self.db).save_unread_count(self.me.as_str(), peer.as_str(), count) {
            warn!(peer = %peer, error = %e, "failed to persist unread count");
        }
    }

    fn persist_count(&self, peer: &UserId, count: usize) {
        if let Err(e) = lock(&self.db).save_message_count(self.me.as_str(), peer.as_str(), count) {
            warn!(peer = %peer, error = %e, "failed to persist message count");
        }
    }
}

struct WatchState {
    closed: bool,
    conversations: BTreeMap<ConversationId, Subscription>,
}

/// Feed every conversation of the tracker's user into `tracker`.
///
/// Subscribes to the user's conversation list and to each conversation's
/// messages; `on_change` receives the full counter map after every
/// observation.  Conversations appearing later are picked up automatically.
pub fn watch_unread<B: DocumentBackend>(
    backend: &Arc<B>,
    tracker: Arc<Mutex<UnreadTracker>>,
    on_change: impl FnMut(HashMap<UserId, u32>, u32) + Send + 'static,
) -> Subscription {
    let me = lock(&tracker).me().clone();
    let state = Arc::new(Mutex::new(WatchState {
        closed: false,
        conversations: BTreeMap::new(),
    }));
    let on_change: Arc<Mutex<dyn FnMut(HashMap<UserId, u32>, u32) + Send>> =
        Arc::new(Mutex::new(on_change));

    let list_sub = {
        let inner_backend = Arc::clone(backend);
        let state = Arc::clone(&state);
        let owner = me.clone();
        backend.watch_conversations(
            &me,
            Box::new(tolerate_permission_errors(
                move |result: std::result::Result<Vec<DirectMessageConversation>, BackendError>| {
                    match result {
                        Ok(list) => {
                            sync_conversations(&inner_backend, &state, &tracker, &on_change, &owner, list)
                        }
                        Err(e) => warn!(error = %e, "conversation list unavailable"),
                    }
                },
            )),
        )
    };

    Subscription::new(move || {
        list_sub.unsubscribe();
        let subs = {
            let mut state = lock(&state);
            state.closed = true;
            std::mem::take(&mut state.conversations)
        };
        for (_, sub) in subs {
            sub.unsubscribe();
        }
    })
}

fn sync_conversations<B: DocumentBackend>(
    backend: &Arc<B>,
    state: &Arc<Mutex<WatchState>>,
    tracker: &Arc<Mutex<UnreadTracker>>,
    on_change: &Arc<Mutex<dyn FnMut(HashMap<UserId, u32>, u32) + Send>>,
    me: &UserId,
    conversations: Vec<DirectMessageConversation>,
) {
    let (added, removed) = {
        let mut state = lock(state);
        if state.closed {
            return;
        }
        let stale: Vec<ConversationId> = state
            .conversations
            .keys()
            .filter(|id| !conversations.iter().any(|c| &c.id == *id))
            .cloned()
            .collect();
        let removed: Vec<Subscription> = stale
            .iter()
            .filter_map(|id| state.conversations.remove(id))
            .collect();
        let added: Vec<DirectMessageConversation> = conversations
            .into_iter()
            .filter(|c| !state.conversations.contains_key(&c.id))
            .collect();
        (added, removed)
    };

    for sub in removed {
        sub.unsubscribe();
    }

    for conversation in added {
        let Some(peer) = conversation.peer_of(me).cloned() else {
            continue;
        };
        let tracker = Arc::clone(tracker);
        let on_change = Arc::clone(on_change);
        let sub = backend.watch_direct_messages(
            &conversation.id,
            Box::new(tolerate_permission_errors(
                move |result: std::result::Result<Vec<DirectMessage>, BackendError>| {
                    let messages = match result {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "direct messages unavailable");
                            return;
                        }
                    };
                    let (counts, total) = {
                        let mut tracker = lock(&tracker);
                        tracker.observe_conversation(&peer, &messages);
                        (tracker.counts(), tracker.total())
                    };
                    (&mut *lock(&on_change))(counts, total);
                },
            )),
        );

        let mut state = lock(state);
        if state.closed {
            drop(state);
            sub.unsubscribe();
        } else {
            state.conversations.insert(conversation.id, sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use agora_store::Database;

    use super::*;

    fn shared_db() -> SharedDatabase {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    fn tracker() -> UnreadTracker {
        UnreadTracker::load(shared_db(), "me".into()).unwrap()
    }

    #[test]
    fn burst_from_inactive_peer_counts_each_message() {
        let mut t = tracker();
        let bob: UserId = "bob".into();
        assert_eq!(t.observe(&bob, 2, Some(&bob)), 0);
        assert_eq!(t.observe(&bob, 5, Some(&bob)), 3);
        assert_eq!(t.total(), 3);

        t.open_conversation(&bob);
        assert_eq!(t.unread(&bob), 0);
        assert_eq!(t.total(), 0);
    }

    #[test]
    fn own_messages_and_active_peer_do_not_count() {
        let mut t = tracker();
        let me: UserId = "me".into();
        let bob: UserId = "bob".into();
        t.observe(&bob, 0, None);

        assert_eq!(t.observe(&bob, 1, Some(&me)), 0);

        t.set_active_peer(Some(bob.clone()));
        assert_eq!(t.observe(&bob, 3, Some(&bob)), 0);

        t.set_active_peer(None);
        assert_eq!(t.observe(&bob, 4, Some(&bob)), 1);
    }

    #[test]
    fn deletions_only_rebaseline() {
        let mut t = tracker();
        let bob: UserId = "bob".into();
        t.observe(&bob, 4, Some(&bob));
        assert_eq!(t.observe(&bob, 2, Some(&bob)), 0);
        assert_eq!(t.observe(&bob, 3, Some(&bob)), 1);
    }

    #[test]
    fn counters_survive_restart() {
        let db = shared_db();
        let bob: UserId = "bob".into();
        {
            let mut t = UnreadTracker::load(db.clone(), "me".into()).unwrap();
            t.observe(&bob, 1, Some(&bob));
            t.observe(&bob, 4, Some(&bob));
        }

        let mut t = UnreadTracker::load(db.clone(), "me".into()).unwrap();
        assert_eq!(t.unread(&bob), 3);
        // The stored baseline prevents recounting the same messages.
        assert_eq!(t.observe(&bob, 4, Some(&bob)), 3);

        t.open_conversation(&bob);
        let t = UnreadTracker::load(db, "me".into()).unwrap();
        assert_eq!(t.total(), 0);
    }

    fn dm(id: &str, sender: &str) -> DirectMessage {
        DirectMessage {
            id: id.into(),
            conversation_id: ConversationId::from("bob_me"),
            sender_id: sender.into(),
            text: id.to_string(),
            timestamp: chrono::Utc::now(),
            reactions: Default::default(),
        }
    }

    #[test]
    fn discovered_conversation_counts_peer_messages() {
        let mut t = tracker();
        let bob: UserId = "bob".into();
        let history = vec![dm("1", "bob"), dm("2", "me"), dm("3", "bob")];
        assert_eq!(t.observe_conversation(&bob, &history), 2);

        // The same snapshot again is not recounted.
        assert_eq!(t.observe_conversation(&bob, &history), 2);

        let mut more = history.clone();
        more.push(dm("4", "bob"));
        assert_eq!(t.observe_conversation(&bob, &more), 3);
    }

    #[test]
    fn discovered_conversation_on_screen_stays_read() {
        let mut t = tracker();
        let bob: UserId = "bob".into();
        t.set_active_peer(Some(bob.clone()));
        assert_eq!(t.observe_conversation(&bob, &[dm("1", "bob")]), 0);
    }

    #[test]
    fn counters_are_isolated_per_user() {
        let db = shared_db();
        let bob: UserId = "bob".into();
        {
            let mut alice = UnreadTracker::load(db.clone(), "alice".into()).unwrap();
            alice.observe(&bob, 0, None);
            alice.observe(&bob, 3, Some(&bob));
            assert_eq!(alice.total(), 3);
        }

        let mut carol = UnreadTracker::load(db.clone(), "carol".into()).unwrap();
        assert_eq!(carol.total(), 0);
        // No baseline leaked from alice either.
        assert_eq!(carol.observe(&bob, 3, Some(&bob)), 0);

        let alice = UnreadTracker::load(db, "alice".into()).unwrap();
        assert_eq!(alice.unread(&bob), 3);
    }
}
