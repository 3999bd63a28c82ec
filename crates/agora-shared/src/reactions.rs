//! Per-message reaction maps with a single-reaction-per-user policy.
//!
//! A message's reactions are a map of emoji to [`ReactionEntry`].  A user
//! holds at most one emoji per message, every entry's `count` equals the
//! length of its user list, and entries never persist empty.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Users who reacted with one emoji.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionEntry {
    pub count: u32,
    #[serde(default)]
    pub users: Vec<UserId>,
}

impl ReactionEntry {
    pub fn contains(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }
}

/// Outcome of a reaction update, for logging and UI feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionChange {
    /// The user had no reaction and now holds `emoji`.
    Added { emoji: String },
    /// The user moved from `from` to `to`.
    Switched { from: String, to: String },
    /// The user already held this emoji; nothing changed.
    Unchanged { emoji: String },
    /// The user's reaction was removed.
    Removed { emoji: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, ReactionEntry>);

impl Reactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, emoji: &str) -> Option<&ReactionEntry> {
        self.0.get(emoji)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReactionEntry)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Emoji currently held by `user`, if any.
    pub fn held_by(&self, user: &UserId) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, entry)| entry.contains(user))
            .map(|(emoji, _)| emoji.as_str())
    }

    /// Total number of reacting users across all emojis.
    pub fn total(&self) -> u32 {
        self.0.values().map(|e| e.count).sum()
    }

    /// Picker path: the user ends up holding `emoji`.
    ///
    /// Any previous reaction by the user is removed first, then the user is
    /// added to `emoji`.  Re-selecting the emoji the user already holds is
    /// idempotent.
    pub fn apply(&mut self, user: &UserId, emoji: &str) -> ReactionChange {
        let previous = self.remove_user(user);

        let entry = self.0.entry(emoji.to_string()).or_default();
        entry.users.push(user.clone());
        entry.count += 1;

        match previous {
            None => ReactionChange::Added {
                emoji: emoji.to_string(),
            },
            Some(from) if from == emoji => ReactionChange::Unchanged { emoji: from },
            Some(from) => ReactionChange::Switched {
                from,
                to: emoji.to_string(),
            },
        }
    }

    /// Reaction-chip path: clicking the emoji the user already holds
    /// removes it; clicking any other emoji behaves like [`Reactions::apply`].
    pub fn toggle(&mut self, user: &UserId, emoji: &str) -> ReactionChange {
        let already_held = self.get(emoji).is_some_and(|e| e.contains(user));
        if already_held {
            self.remove_user(user);
            return ReactionChange::Removed {
                emoji: emoji.to_string(),
            };
        }
        self.apply(user, emoji)
    }

    /// Remove `user` from every entry, dropping entries that become empty.
    ///
    /// Returns the emoji the user held, if any.
    pub fn remove_user(&mut self, user: &UserId) -> Option<String> {
        let mut held = None;
        for (emoji, entry) in self.0.iter_mut() {
            let before = entry.users.len();
            entry.users.retain(|u| u != user);
            let removed = before - entry.users.len();
            if removed > 0 {
                entry.count = entry.count.saturating_sub(removed as u32);
                held.get_or_insert_with(|| emoji.clone());
            }
        }
        self.0.retain(|_, entry| entry.count > 0);
        held
    }

    /// Repair a map decoded from the backend so that it satisfies the
    /// reaction invariants.
    ///
    /// Duplicate users are collapsed, a user listed under several emojis
    /// keeps only the first one in emoji order, counts are reset to the
    /// user-list length, and empty entries are dropped.  Returns `true` if
    /// anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut seen: HashSet<UserId> = HashSet::new();
        let mut changed = false;
        for entry in self.0.values_mut() {
            let before = entry.users.len();
            entry.users.retain(|u| seen.insert(u.clone()));
            if entry.users.len() != before || entry.count as usize != entry.users.len() {
                changed = true;
            }
            entry.count = entry.users.len() as u32;
        }
        let before = self.0.len();
        self.0.retain(|_, entry| entry.count > 0);
        changed || self.0.len() != before
    }
}

impl FromIterator<(String, ReactionEntry)> for Reactions {
    fn from_iter<I: IntoIterator<Item = (String, ReactionEntry)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Merge several per-message reaction maps into total counts per emoji.
pub fn aggregate<'a, I>(maps: I) -> BTreeMap<String, u32>
where
    I: IntoIterator<Item = &'a Reactions>,
{
    maps.into_iter()
        .flat_map(|r| r.iter())
        .fold(BTreeMap::new(), |mut totals, (emoji, entry)| {
            *totals.entry(emoji.clone()).or_insert(0) += entry.count;
            totals
        })
}
