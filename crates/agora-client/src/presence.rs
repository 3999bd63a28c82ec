//! Presence: publishing our own online/offline marker and observing others.
//!
//! [`PresenceTracker`] turns the backend connectivity signal into presence
//! writes for the signed-in user.  [`PresenceCache`] shares one upstream
//! watch per observed user between any number of view subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agora_shared::constants::presence_path;
use agora_shared::{PresenceRecord, PresenceState, UserId};

use crate::backend::PresenceBackend;
use crate::subscription::{lock, Feed, Subscription};

/// Where the tracker is in the connect / announce cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    /// No connectivity listener (signed out).
    Disconnected,
    /// Socket is up; the on-disconnect hook and online marker are in flight.
    ConnectedPending,
    /// On-disconnect hook registered and online marker written.
    Online,
    /// Socket dropped, or the user signed out explicitly.
    Offline,
}

struct Session {
    user_id: UserId,
    connectivity: Subscription,
    worker: JoinHandle<()>,
}

impl Session {
    fn teardown(self) {
        self.worker.abort();
        self.connectivity.unsubscribe();
    }
}

/// Announces the signed-in user's presence.
///
/// At most one session is active per tracker.  All methods that start a
/// session must be called from within a tokio runtime.
pub struct PresenceTracker<B: PresenceBackend> {
    backend: Arc<B>,
    session: Mutex<Option<Session>>,
    status: Arc<watch::Sender<PresenceStatus>>,
}

impl<B: PresenceBackend> PresenceTracker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (status, _) = watch::channel(PresenceStatus::Disconnected);
        Self {
            backend,
            session: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<PresenceStatus> {
        self.status.subscribe()
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.session).as_ref().map(|s| s.user_id.clone())
    }

    /// Start tracking `user_id`, replacing any previous session.
    ///
    /// The session slot stays locked from teardown to install, so
    /// concurrent logins never leave an orphaned listener behind.
    pub fn on_login(&self, user_id: UserId) {
        let mut session = lock(&self.session);
        if let Some(previous) = session.take() {
            debug!(user = %previous.user_id, "replacing presence session");
            previous.teardown();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connectivity = self.backend.watch_connectivity(Box::new(move |connected| {
            // The receiver only goes away when the session is torn down.
            let _ = tx.send(connected);
        }));

        let worker = tokio::spawn(connectivity_loop(
            Arc::clone(&self.backend),
            user_id.clone(),
            rx,
            Arc::clone(&self.status),
        ));

        info!(user = %user_id, "presence tracking started");
        *session = Some(Session {
            user_id,
            connectivity,
            worker,
        });
    }

    /// Stop tracking without writing anything (auth state cleared or user
    /// swapped).  The backend's on-disconnect hook still covers the user.
    pub fn on_logout(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            info!(user = %session.user_id, "presence tracking stopped");
            session.teardown();
        }
        self.status.send_replace(PresenceStatus::Disconnected);
    }

    /// Explicit sign-out: mark the user offline, cancel the on-disconnect
    /// hook, then drop the session.
    ///
    /// Failures are logged and never prevent the sign-out from completing.
    pub async fn sign_out(&self) {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            return;
        };
        session.worker.abort();

        let user_id = &session.user_id;
        if let Err(e) = self
            .backend
            .write_presence(user_id, PresenceState::Offline)
            .await
        {
            warn!(user = %user_id, error = %e, "failed to write offline presence");
        }
        if let Err(e) = self.backend.cancel_on_disconnect(user_id).await {
            warn!(user = %user_id, error = %e, "failed to cancel on-disconnect hook");
        }

        session.connectivity.unsubscribe();
        self.status.send_replace(PresenceStatus::Offline);
        info!(user = %user_id, "signed out, presence offline");
    }
}

/// Per-session worker: reacts to connectivity changes in arrival order.
async fn connectivity_loop<B: PresenceBackend>(
    backend: Arc<B>,
    user_id: UserId,
    mut signals: mpsc::UnboundedReceiver<bool>,
    status: Arc<watch::Sender<PresenceStatus>>,
) {
    while let Some(connected) = signals.recv().await {
        if !connected {
            status.send_if_modified(|s| match *s {
                PresenceStatus::Online | PresenceStatus::ConnectedPending => {
                    *s = PresenceStatus::Offline;
                    true
                }
                _ => false,
            });
            debug!(user = %user_id, "connection lost");
            continue;
        }

        status.send_replace(PresenceStatus::ConnectedPending);

        // The online marker is only written once the backend has promised
        // to clear it again.
        if let Err(e) = backend
            .register_on_disconnect(&user_id, PresenceState::Offline)
            .await
        {
            warn!(user = %user_id, error = %e, "failed to register on-disconnect hook");
            continue;
        }

        match backend.write_presence(&user_id, PresenceState::Online).await {
            Ok(()) => {
                status.send_replace(PresenceStatus::Online);
                debug!(user = %user_id, "presence online");
            }
            Err(e) => warn!(user = %user_id, error = %e, "failed to write online presence"),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    feed: Feed<(u64, Option<PresenceRecord>)>,
    /// Number of upstream emissions so far; `0` until the first one.
    version: u64,
    last: Option<PresenceRecord>,
    upstream: Option<Subscription>,
    subscribers: usize,
}

type Entries = Arc<Mutex<HashMap<UserId, CacheEntry>>>;

/// One subscriber's handler plus the newest version it has seen, so a
/// replayed record never overtakes a live one.
struct Replay<F> {
    handler: F,
    seen: u64,
}

impl<F: FnMut(Option<PresenceRecord>)> Replay<F> {
    fn deliver(&mut self, version: u64, record: Option<PresenceRecord>) {
        if version > self.seen {
            self.seen = version;
            (self.handler)(record);
        }
    }
}

/// Reference-counted presence watches, one upstream listener per user.
pub struct PresenceCache<B: PresenceBackend> {
    backend: Arc<B>,
    entries: Entries,
}

impl<B: PresenceBackend> PresenceCache<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            entries: Arc::default(),
        }
    }

    /// Observe `user_id`.  A subscriber joining an existing entry receives
    /// the last known record immediately.
    pub fn subscribe(
        &self,
        user_id: &UserId,
        handler: impl FnMut(Option<PresenceRecord>) + Send + 'static,
    ) -> Subscription {
        let replay = Arc::new(Mutex::new(Replay { handler, seen: 0 }));
        let live = Arc::clone(&replay);

        // The listener is attached under the entries lock, so no emission
        // can fall between reading `last` and joining the feed.
        let (listener, cached, fresh) = {
            let mut entries = lock(&self.entries);
            let fresh = !entries.contains_key(user_id);
            let entry = entries.entry(user_id.clone()).or_insert_with(|| CacheEntry {
                feed: Feed::new(),
                version: 0,
                last: None,
                upstream: None,
                subscribers: 0,
            });
            entry.subscribers += 1;
            let listener = entry
                .feed
                .subscribe(move |(version, record): &(u64, Option<PresenceRecord>)| {
                    lock(&live).deliver(*version, *record)
                });
            (listener, (entry.version, entry.last), fresh)
        };

        let (version, last) = cached;
        if version > 0 {
            lock(&replay).deliver(version, last);
        }
        if fresh {
            self.attach_upstream(user_id);
        }

        let entries = Arc::downgrade(&self.entries);
        let user_id = user_id.clone();
        Subscription::new(move || {
            listener.unsubscribe();
            release(&entries, &user_id);
        })
    }

    fn attach_upstream(&self, user_id: &UserId) {
        debug!(path = %presence_path(user_id), "attaching presence watch");
        let weak = Arc::downgrade(&self.entries);
        let key = user_id.clone();
        let upstream = self.backend.watch_presence(
            user_id,
            Box::new(move |record| {
                let Some(entries) = weak.upgrade() else {
                    return;
                };
                let (feed, version) = {
                    let mut entries = lock(&entries);
                    let Some(entry) = entries.get_mut(&key) else {
                        return;
                    };
                    entry.version += 1;
                    entry.last = record;
                    (entry.feed.clone(), entry.version)
                };
                feed.publish(&(version, record));
            }),
        );

        let mut entries = lock(&self.entries);
        match entries.get_mut(user_id) {
            Some(entry) => entry.upstream = Some(upstream),
            None => {
                // Every subscriber left while the watch was being attached.
                drop(entries);
                upstream.unsubscribe();
            }
        }
    }

    pub fn last_known(&self, user_id: &UserId) -> Option<PresenceRecord> {
        lock(&self.entries).get(user_id).and_then(|e| e.last)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.last_known(user_id).is_some_and(|r| r.is_online())
    }

    /// Number of users with at least one subscriber.
    pub fn active_entries(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn subscriber_count(&self, user_id: &UserId) -> usize {
        lock(&self.entries).get(user_id).map_or(0, |e| e.subscribers)
    }
}

fn release(entries: &Weak<Mutex<HashMap<UserId, CacheEntry>>>, user_id: &UserId) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let upstream = {
        let mut entries = lock(&entries);
        let Some(entry) = entries.get_mut(user_id) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }
        entries.remove(user_id).and_then(|e| e.upstream)
    };
    if let Some(upstream) = upstream {
        debug!(user = %user_id, "last presence subscriber left");
        upstream.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::backend::memory::{MemoryBackend, PresenceOp};
    use crate::backend::BackendError;

    async fn wait_for(rx: &mut watch::Receiver<PresenceStatus>, want: PresenceStatus) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for presence status")
            .expect("status sender dropped");
    }

    #[tokio::test]
    async fn registers_hook_before_writing_online() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_connected(true);
        let tracker = PresenceTracker::new(backend.clone());
        let mut status = tracker.watch_status();

        tracker.on_login("alice".into());
        wait_for(&mut status, PresenceStatus::Online).await;

        let alice: UserId = "alice".into();
        assert_eq!(
            backend.presence_log(),
            vec![
                PresenceOp::RegisterOnDisconnect(alice.clone(), PresenceState::Offline),
                PresenceOp::Write(alice.clone(), PresenceState::Online),
            ]
        );
        assert!(backend.presence_of(&alice).unwrap().is_online());
        tracker.on_logout();
    }

    #[tokio::test]
    async fn connection_drop_marks_offline() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_connected(true);
        let tracker = PresenceTracker::new(backend.clone());
        let mut status = tracker.watch_status();
        tracker.on_login("alice".into());
        wait_for(&mut status, PresenceStatus::Online).await;

        backend.set_connected(false);
        wait_for(&mut status, PresenceStatus::Offline).await;
        assert!(!backend.presence_of(&"alice".into()).unwrap().is_online());

        backend.set_connected(true);
        wait_for(&mut status, PresenceStatus::Online).await;
        tracker.on_logout();
        assert_eq!(tracker.status(), PresenceStatus::Disconnected);
    }

    #[tokio::test]
    async fn sign_out_writes_offline_then_cancels_hook() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_connected(true);
        let tracker = PresenceTracker::new(backend.clone());
        let mut status = tracker.watch_status();
        tracker.on_login("alice".into());
        wait_for(&mut status, PresenceStatus::Online).await;

        tracker.sign_out().await;

        let alice: UserId = "alice".into();
        let log = backend.presence_log();
        assert_eq!(
            &log[log.len() - 2..],
            &[
                PresenceOp::Write(alice.clone(), PresenceState::Offline),
                PresenceOp::CancelOnDisconnect(alice.clone()),
            ]
        );
        assert!(!backend.has_on_disconnect(&alice));
        assert_eq!(tracker.status(), PresenceStatus::Offline);
        assert!(tracker.current_user().is_none());
    }

    #[tokio::test]
    async fn failed_hook_skips_online_write() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_presence_writes(Some(BackendError::Unavailable("down".into())));
        backend.set_connected(true);
        let tracker = PresenceTracker::new(backend.clone());
        let mut status = tracker.watch_status();
        tracker.on_login("alice".into());
        wait_for(&mut status, PresenceStatus::ConnectedPending).await;

        // Give the worker a chance to (not) write.
        tokio::task::yield_now().await;
        assert!(backend.presence_log().is_empty());
        assert!(backend.presence_of(&"alice".into()).is_none());

        // Sign-out still completes despite the failing store.
        tracker.sign_out().await;
        assert_eq!(tracker.status(), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn user_swap_replaces_session() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_connected(true);
        let tracker = PresenceTracker::new(backend.clone());
        let mut status = tracker.watch_status();

        tracker.on_login("alice".into());
        wait_for(&mut status, PresenceStatus::Online).await;
        tracker.on_login("bob".into());
        assert_eq!(tracker.current_user(), Some("bob".into()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.presence_of(&"bob".into()).is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("bob never came online");
        tracker.on_logout();
    }

    #[tokio::test]
    async fn cache_shares_one_upstream_watch() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_server_time(Some(Utc.timestamp_opt(50, 0).unwrap()));
        let bob: UserId = "bob".into();
        backend.write_presence(&bob, PresenceState::Online).await.unwrap();

        let cache = PresenceCache::new(backend.clone());
        let first: Arc<Mutex<Vec<Option<PresenceRecord>>>> = Arc::default();
        let second: Arc<Mutex<Vec<Option<PresenceRecord>>>> = Arc::default();

        let sink = first.clone();
        let s1 = cache.subscribe(&bob, move |r| sink.lock().unwrap().push(r));
        let sink = second.clone();
        let s2 = cache.subscribe(&bob, move |r| sink.lock().unwrap().push(r));

        assert_eq!(backend.presence_listener_count(&bob), 1);
        assert_eq!(cache.subscriber_count(&bob), 2);
        // The late subscriber got the cached record without a new watch.
        assert_eq!(second.lock().unwrap().len(), 1);
        assert!(cache.is_online(&bob));

        backend.write_presence(&bob, PresenceState::Offline).await.unwrap();
        assert_eq!(first.lock().unwrap().len(), 2);
        assert_eq!(second.lock().unwrap().len(), 2);

        s1.unsubscribe();
        assert_eq!(backend.presence_listener_count(&bob), 1);
        s2.unsubscribe();
        assert_eq!(backend.presence_listener_count(&bob), 0);
        assert_eq!(cache.active_entries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_logins_leave_one_session() {
        for _ in 0..50 {
            let backend = Arc::new(MemoryBackend::new());
            let tracker = Arc::new(PresenceTracker::new(backend.clone()));

            let logins: Vec<_> = ["alice", "bob"]
                .into_iter()
                .map(|user| {
                    let tracker = Arc::clone(&tracker);
                    tokio::task::spawn_blocking(move || tracker.on_login(user.into()))
                })
                .collect();
            for login in logins {
                login.await.unwrap();
            }
            assert_eq!(backend.connectivity_listener_count(), 1);

            tracker.on_logout();
            assert_eq!(backend.connectivity_listener_count(), 0);

            backend.set_connected(true);
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(backend.presence_log().is_empty());
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_updates_after_its_replay() {
        let backend = Arc::new(MemoryBackend::new());
        let bob: UserId = "bob".into();
        backend.write_presence(&bob, PresenceState::Online).await.unwrap();

        let cache = PresenceCache::new(backend.clone());
        let s1 = cache.subscribe(&bob, |_| {});

        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
        let sink = seen.clone();
        let s2 = cache.subscribe(&bob, move |r: Option<PresenceRecord>| {
            sink.lock().unwrap().push(r.is_some_and(|r| r.is_online()))
        });
        backend.write_presence(&bob, PresenceState::Offline).await.unwrap();
        backend.write_presence(&bob, PresenceState::Online).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![true, false, true]);
        assert!(cache.is_online(&bob));
        s2.unsubscribe();
        s1.unsubscribe();
    }
}
