//! Live channel timeline.
//!
//! A channel's messages are spread over one stream per topic.
//! [`ChannelTimeline`] follows the channel's topic list, keeps the latest
//! snapshot of every topic stream and republishes the merged view after
//! each emission.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use agora_shared::timeline::{root_timeline, thread_replies};
use agora_shared::{ChannelId, Message, MessageId, Topic, TopicId};

use crate::backend::{BackendError, DocumentBackend};
use crate::subscription::{lock, Subscription};

/// Which slice of the channel to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineView {
    /// Root messages with thread counts.
    Channel,
    /// Replies to one root message.
    Thread(MessageId),
}

type TimelineHandler = Arc<Mutex<dyn FnMut(Result<Vec<Message>, BackendError>) + Send>>;

struct TimelineState {
    closed: bool,
    streams: BTreeMap<TopicId, Vec<Message>>,
    topic_subs: HashMap<TopicId, Subscription>,
}

struct Shared<B> {
    backend: Arc<B>,
    channel_id: ChannelId,
    view: TimelineView,
    state: Mutex<TimelineState>,
    handler: TimelineHandler,
}

pub struct ChannelTimeline;

impl ChannelTimeline {
    /// Follow `channel_id` and deliver `view` to `handler` after every
    /// change.  A channel with no topics yields an empty list.
    ///
    /// Permission errors are treated as empty streams; any other error is
    /// passed to `handler`.
    pub fn watch<B: DocumentBackend>(
        backend: &Arc<B>,
        channel_id: &ChannelId,
        view: TimelineView,
        handler: impl FnMut(Result<Vec<Message>, BackendError>) + Send + 'static,
    ) -> Subscription {
        let shared = Arc::new(Shared {
            backend: Arc::clone(backend),
            channel_id: channel_id.clone(),
            view,
            state: Mutex::new(TimelineState {
                closed: false,
                streams: BTreeMap::new(),
                topic_subs: HashMap::new(),
            }),
            handler: Arc::new(Mutex::new(handler)),
        });

        let topics_sub = {
            let shared = Arc::clone(&shared);
            backend.watch_topics(
                channel_id,
                Box::new(move |result: Result<Vec<Topic>, BackendError>| match result {
                    Ok(topics) => sync_topics(&shared, topics),
                    Err(e) if e.is_permission_error() => sync_topics(&shared, Vec::new()),
                    Err(e) => shared.deliver(Err(e)),
                }),
            )
        };

        Subscription::new(move || {
            topics_sub.unsubscribe();
            let subs = {
                let mut state = lock(&shared.state);
                state.closed = true;
                state.streams.clear();
                std::mem::take(&mut state.topic_subs)
            };
            for (_, sub) in subs {
                sub.unsubscribe();
            }
            debug!(channel = %shared.channel_id, "timeline closed");
        })
    }
}

impl<B: DocumentBackend> Shared<B> {
    fn deliver(&self, result: Result<Vec<Message>, BackendError>) {
        if lock(&self.state).closed {
            return;
        }
        (&mut *lock(&self.handler))(result);
    }

    /// Merge the current topic snapshots and publish the configured view.
    fn emit(&self) {
        let streams: Vec<Vec<Message>> = {
            let state = lock(&self.state);
            if state.closed {
                return;
            }
            state.streams.values().cloned().collect()
        };
        let merged = match &self.view {
            TimelineView::Channel => root_timeline(&streams),
            TimelineView::Thread(parent) => thread_replies(&streams, parent),
        };
        self.deliver(Ok(merged));
    }
}

fn sync_topics<B: DocumentBackend>(shared: &Arc<Shared<B>>, topics: Vec<Topic>) {
    let (added, removed) = {
        let mut state = lock(&shared.state);
        if state.closed {
            return;
        }
        let stale: Vec<TopicId> = state
            .topic_subs
            .keys()
            .filter(|id| !topics.iter().any(|t| &t.id == *id))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for id in &stale {
            state.streams.remove(id);
            if let Some(sub) = state.topic_subs.remove(id) {
                removed.push(sub);
            }
        }
        let added: Vec<Topic> = topics
            .into_iter()
            .filter(|t| !state.topic_subs.contains_key(&t.id))
            .collect();
        (added, removed)
    };

    let had_removals = !removed.is_empty();
    for sub in removed {
        sub.unsubscribe();
    }

    if added.is_empty() {
        // Topic renames and activity bumps change nothing in the merge;
        // only removals and an empty channel need a fresh emission.
        let empty = lock(&shared.state).topic_subs.is_empty();
        if had_removals || empty {
            shared.emit();
        }
        return;
    }

    for topic in added {
        debug!(channel = %shared.channel_id, topic = %topic.id, "following topic");
        let topic_id = topic.id.clone();
        let inner = Arc::clone(shared);
        let stream_topic = topic_id.clone();
        let sub = shared.backend.watch_topic_messages(
            &shared.channel_id,
            &topic,
            Box::new(move |result: Result<Vec<Message>, BackendError>| {
                let messages = match result {
                    Ok(messages) => messages,
                    Err(e) if e.is_permission_error() => Vec::new(),
                    Err(e) => return inner.deliver(Err(e)),
                };
                {
                    let mut state = lock(&inner.state);
                    if state.closed {
                        return;
                    }
                    state.streams.insert(stream_topic.clone(), messages);
                }
                inner.emit();
            }),
        );

        let mut state = lock(&shared.state);
        if state.closed {
            drop(state);
            sub.unsubscribe();
        } else {
            state.topic_subs.insert(topic_id, sub);
        }
    }
}
