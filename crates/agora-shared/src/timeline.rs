//! Channel timeline assembly.
//!
//! A channel's messages arrive as independent per-topic streams.  These
//! helpers flatten the latest snapshot of every stream into the views the
//! UI shows: the root timeline with per-message reply counts, and the reply
//! list of a single thread.  Only per-stream order is assumed; the merge
//! re-sorts globally.

use std::collections::HashMap;

use crate::models::Message;
use crate::types::MessageId;

fn chronological(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

/// Flatten per-topic message lists into one list ordered by timestamp.
///
/// Equal timestamps are ordered by message id.
pub fn merge_topics(streams: &[Vec<Message>]) -> Vec<Message> {
    let mut merged: Vec<Message> = streams.iter().flatten().cloned().collect();
    merged.sort_by(chronological);
    merged
}

/// Number of replies per parent message id.
pub fn thread_counts<'a, I>(messages: I) -> HashMap<MessageId, u32>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut counts = HashMap::new();
    for message in messages {
        if let Some(parent) = &message.parent_message_id {
            *counts.entry(parent.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Root messages of the channel, oldest first, each annotated with the
/// number of replies found in any topic.
pub fn root_timeline(streams: &[Vec<Message>]) -> Vec<Message> {
    let counts = thread_counts(streams.iter().flatten());
    let mut roots: Vec<Message> = streams
        .iter()
        .flatten()
        .filter(|m| m.is_root())
        .map(|m| {
            let mut root = m.clone();
            root.thread_count = counts.get(&m.id).copied().unwrap_or(0);
            root
        })
        .collect();
    roots.sort_by(chronological);
    roots
}

/// Replies to `parent`, oldest first.
pub fn thread_replies(streams: &[Vec<Message>], parent: &MessageId) -> Vec<Message> {
    let mut replies: Vec<Message> = streams
        .iter()
        .flatten()
        .filter(|m| m.is_reply_to(parent))
        .cloned()
        .collect();
    replies.sort_by(chronological);
    replies
}
