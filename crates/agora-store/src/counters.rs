//! Typed helpers for the unread-count and last-known message-count scopes.
//!
//! Both scopes are partitioned by the signed-in user, so accounts sharing
//! one database never see each other's counters.

use std::collections::HashMap;

use agora_shared::constants::{SCOPE_MESSAGE_COUNTS, SCOPE_UNREAD_COUNTS};

use crate::database::Database;
use crate::error::Result;

fn owner_scope(scope: &str, owner_id: &str) -> String {
    format!("{scope}/{owner_id}")
}

impl Database {
    /// Unread counters of `owner_id`, keyed by peer id.
    pub fn load_unread_counts(&self, owner_id: &str) -> Result<HashMap<String, u32>> {
        self.load_scope(&owner_scope(SCOPE_UNREAD_COUNTS, owner_id))
    }

    /// Persist `owner_id`'s unread counter for `peer_id`.  A zero counter
    /// removes the entry instead of storing it.
    pub fn save_unread_count(&self, owner_id: &str, peer_id: &str, count: u32) -> Result<()> {
        let scope = owner_scope(SCOPE_UNREAD_COUNTS, owner_id);
        if count == 0 {
            self.remove_json(&scope, peer_id)?;
        } else {
            self.put_json(&scope, peer_id, &count)?;
        }
        Ok(())
    }

    pub fn load_message_counts(&self, owner_id: &str) -> Result<HashMap<String, usize>> {
        self.load_scope(&owner_scope(SCOPE_MESSAGE_COUNTS, owner_id))
    }

    pub fn save_message_count(&self, owner_id: &str, peer_id: &str, count: usize) -> Result<()> {
        self.put_json(&owner_scope(SCOPE_MESSAGE_COUNTS, owner_id), peer_id, &count)
    }
}
