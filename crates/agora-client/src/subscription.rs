//! Publish/subscribe primitives.
//!
//! Every push stream in the client is exposed as `subscribe(handler) ->
//! Subscription`.  A [`Subscription`] does nothing when dropped: callers
//! tear listeners down explicitly with [`Subscription::unsubscribe`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an active listener.
#[must_use = "a subscription stays active until `unsubscribe` is called"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down, returned for streams that
    /// completed immediately.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Combine several subscriptions into one that cancels them all.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for sub in subscriptions {
                sub.unsubscribe();
            }
        })
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type Listener<T> = Arc<Mutex<dyn FnMut(&T) + Send>>;

struct FeedInner<T: 'static> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A fan-out point: every published value is delivered to every listener,
/// in subscription order.
///
/// No lock is held while listeners run, so a listener may subscribe,
/// unsubscribe or publish without deadlocking.
pub struct Feed<T: 'static> {
    inner: Arc<Mutex<FeedInner<T>>>,
}

impl<T: 'static> Feed<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: impl FnMut(&T) + Send + 'static) -> Subscription {
        let listener: Listener<T> = Arc::new(Mutex::new(listener));
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.insert(id, listener);
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).listeners.remove(&id);
            }
        })
    }

    pub fn publish(&self, value: &T) {
        let ids: Vec<u64> = lock(&self.inner).listeners.keys().copied().collect();
        for id in ids {
            // Skip listeners removed by an earlier listener during this publish.
            let Some(listener) = lock(&self.inner).listeners.get(&id).cloned() else {
                continue;
            };
            let mut listener = lock(&listener);
            (&mut *listener)(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

impl<T: 'static> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_subscription_order() {
        let feed: Feed<u32> = Feed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = seen.clone();
            feed.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
        };
        let s2 = {
            let seen = seen.clone();
            feed.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
        };

        feed.publish(&1);
        feed.publish(&2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );

        s1.unsubscribe();
        feed.publish(&3);
        assert_eq!(seen.lock().unwrap().last(), Some(&("b", 3)));
        assert_eq!(feed.listener_count(), 1);
        s2.unsubscribe();
        assert_eq!(feed.listener_count(), 0);
    }

    #[test]
    fn dropping_does_not_unsubscribe() {
        let feed: Feed<u32> = Feed::new();
        let count = Arc::new(Mutex::new(0));
        {
            let count = count.clone();
            let _sub = feed.subscribe(move |_| *count.lock().unwrap() += 1);
        }
        feed.publish(&1);
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(feed.listener_count(), 1);
    }

    #[test]
    fn listener_may_subscribe_during_publish() {
        let feed: Feed<u32> = Feed::new();
        let inner_feed = feed.clone();
        let late = Arc::new(Mutex::new(Vec::new()));
        let late_clone = late.clone();
        let subscribed = Arc::new(Mutex::new(false));

        let _outer = feed.subscribe(move |_| {
            let mut done = subscribed.lock().unwrap();
            if !*done {
                *done = true;
                let late = late_clone.clone();
                let _ = inner_feed.subscribe(move |v| late.lock().unwrap().push(*v));
            }
        });

        feed.publish(&1);
        feed.publish(&2);
        assert_eq!(*late.lock().unwrap(), vec![2]);
    }

    #[test]
    fn all_cancels_every_member() {
        let feed: Feed<u32> = Feed::new();
        let subs = vec![feed.subscribe(|_| {}), feed.subscribe(|_| {})];
        assert_eq!(feed.listener_count(), 2);
        Subscription::all(subs).unsubscribe();
        assert_eq!(feed.listener_count(), 0);
    }

    #[test]
    fn unsubscribe_after_feed_dropped_is_harmless() {
        let feed: Feed<u32> = Feed::new();
        let sub = feed.subscribe(|_| {});
        drop(feed);
        sub.unsubscribe();
        Subscription::noop().unsubscribe();
    }
}
