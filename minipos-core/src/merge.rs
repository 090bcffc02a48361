//! Merge rules for folding incoming changes into a collection.
//!
//! The relay mirror and every terminal apply the same rules so that, given
//! the same ordered stream of changes, they end up with the same state:
//!
//! - add/update: last writer wins, keyed by id
//! - delete: remove by id
//! - session batch: replace only the sessions the batch speaks for
//! - order history: union by id, newest first

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{ActiveSession, MenuItem, Table, User};
use crate::order::{self, OrderHistoryEntry};

/// Records addressable by a stable key.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Table {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for MenuItem {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for User {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for OrderHistoryEntry {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for ActiveSession {
    fn key(&self) -> &str {
        &self.client_id
    }
}

/// What an `add` does when the id is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddPolicy {
    /// Replace the existing record.
    #[default]
    Upsert,
    /// Keep the existing record, drop the incoming one.
    IgnoreDuplicate,
    /// Push regardless. Duplicates are possible.
    Append,
}

/// Per-collection `add` behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub tables: AddPolicy,
    pub menu_items: AddPolicy,
    pub users: AddPolicy,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            tables: AddPolicy::Upsert,
            menu_items: AddPolicy::Upsert,
            users: AddPolicy::IgnoreDuplicate,
        }
    }
}

/// Replaces the record with the same key or appends. Returns `true` if a
/// record was replaced.
pub fn upsert<T: Keyed>(items: &mut Vec<T>, item: T) -> bool {
    match items.iter().position(|existing| existing.key() == item.key()) {
        Some(idx) => {
            items[idx] = item;
            true
        }
        None => {
            items.push(item);
            false
        }
    }
}

/// Applies an `add` under `policy`. Returns `true` if the collection changed.
pub fn insert<T: Keyed>(items: &mut Vec<T>, item: T, policy: AddPolicy) -> bool {
    match policy {
        AddPolicy::Upsert => {
            upsert(items, item);
            true
        }
        AddPolicy::IgnoreDuplicate => {
            if items.iter().any(|existing| existing.key() == item.key()) {
                log::debug!("Ignoring duplicate add for '{}'", item.key());
                false
            } else {
                items.push(item);
                true
            }
        }
        AddPolicy::Append => {
            items.push(item);
            true
        }
    }
}

/// Removes every record with `key`. Returns `true` if anything was removed.
pub fn remove_by_key<T: Keyed>(items: &mut Vec<T>, key: &str) -> bool {
    let before = items.len();
    items.retain(|existing| existing.key() != key);
    items.len() != before
}

pub fn add_category(categories: &mut Vec<String>, name: &str) -> bool {
    if categories.iter().any(|c| c == name) {
        return false;
    }
    categories.push(name.to_string());
    true
}

pub fn remove_category(categories: &mut Vec<String>, name: &str) -> bool {
    let before = categories.len();
    categories.retain(|c| c != name);
    categories.len() != before
}

/// Replaces the sessions a batch speaks for: any session whose client id is
/// in the batch, and any session originating from `from_client`. Sessions
/// from other terminals are kept.
pub fn replace_sessions(
    current: &mut Vec<ActiveSession>,
    batch: &[ActiveSession],
    from_client: Option<&str>,
) {
    current.retain(|session| {
        let in_batch = batch.iter().any(|b| b.client_id == session.client_id);
        let from_origin = from_client.is_some_and(|origin| session.client_id == origin);
        !(in_batch || from_origin)
    });
    for session in batch {
        upsert(current, session.clone());
    }
}

/// Upserts an order, stamping `createdAt` if missing, and re-sorts newest
/// first.
pub fn add_order(history: &mut Vec<OrderHistoryEntry>, mut entry: OrderHistoryEntry, now: DateTime<Utc>) {
    entry.stamp_created_at(now);
    upsert(history, entry);
    order::sort_newest_first(history);
}

/// Union of two histories keyed by id. On collision the `incoming` copy wins.
pub fn merge_order_history(
    local: Vec<OrderHistoryEntry>,
    incoming: Vec<OrderHistoryEntry>,
) -> Vec<OrderHistoryEntry> {
    let mut merged: Vec<OrderHistoryEntry> = Vec::with_capacity(local.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(local.len() + incoming.len());

    for entry in local.into_iter().chain(incoming) {
        match index.get(&entry.id) {
            Some(&idx) => merged[idx] = entry,
            None => {
                index.insert(entry.id.clone(), merged.len());
                merged.push(entry);
            }
        }
    }

    order::sort_newest_first(&mut merged);
    merged
}
