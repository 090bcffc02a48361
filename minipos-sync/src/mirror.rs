//! The relay's in-memory copy of shared state.
//!
//! The mirror is rebuilt from live traffic: it starts empty, folds in every
//! mutation it relays using the same merge rules as the terminals, and is
//! handed out whole on `SYNC_REQUEST`. It is lost when the relay stops.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use minipos_core::merge::{self, MergePolicy};
use minipos_core::{ActiveSession, MenuItem, OrderHistoryEntry, Settings, Table, User};

use crate::protocol::{
    MenuAction, OrderAction, Payload, Snapshot, SyncMessage, TableAction, UserAction,
    UserSyncAction,
};

/// One relayed mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub seq: u64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub action: String,
    pub client_id: String,
    pub timestamp: i64,
    pub data: Value,
}

#[derive(Debug)]
pub struct Mirror {
    tables: Vec<Table>,
    menu_items: Vec<MenuItem>,
    categories: Vec<String>,
    settings: Option<Settings>,
    order_history: Vec<OrderHistoryEntry>,
    active_sessions: Vec<ActiveSession>,
    users: Vec<User>,
    sync_log: Vec<SyncLogEntry>,
    /// Optional cap; oldest entries are dropped past it. Unbounded when `None`.
    sync_log_limit: Option<usize>,
    next_seq: u64,
    policy: MergePolicy,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new(MergePolicy::default())
    }
}

impl Mirror {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            tables: Vec::new(),
            menu_items: Vec::new(),
            categories: Vec::new(),
            settings: None,
            order_history: Vec::new(),
            active_sessions: Vec::new(),
            users: Vec::new(),
            sync_log: Vec::new(),
            sync_log_limit: None,
            next_seq: 0,
            policy,
        }
    }

    pub fn with_sync_log_limit(mut self, limit: Option<usize>) -> Self {
        self.sync_log_limit = limit;
        self
    }

    /// Folds a relayed message into the mirror and appends it to the sync
    /// log. Returns `false` for message types the mirror does not track.
    pub fn apply(&mut self, msg: &SyncMessage) -> bool {
        if !msg.message_type().is_mutation() {
            return false;
        }
        self.fold(&msg.payload);
        self.record(msg);
        true
    }

    fn fold(&mut self, payload: &Payload) {
        let policy = self.policy;
        match payload {
            Payload::UpdateTable(action) => match action {
                TableAction::Add(t) => {
                    merge::insert(&mut self.tables, t.clone(), policy.tables);
                }
                TableAction::Update(t) => {
                    merge::upsert(&mut self.tables, t.clone());
                }
                TableAction::Delete(r) => {
                    merge::remove_by_key(&mut self.tables, &r.id);
                }
            },
            Payload::UpdateOrder(action) => match action {
                OrderAction::Add(o) => merge::add_order(&mut self.order_history, o.clone(), Utc::now()),
                OrderAction::Clear => self.order_history.clear(),
            },
            Payload::UpdateMenu(action) => match action {
                MenuAction::AddItem(m) => {
                    merge::insert(&mut self.menu_items, m.clone(), policy.menu_items);
                }
                MenuAction::UpdateItem(m) => {
                    merge::upsert(&mut self.menu_items, m.clone());
                }
                MenuAction::DeleteItem(r) => {
                    merge::remove_by_key(&mut self.menu_items, &r.id);
                }
                MenuAction::AddCategory(c) => {
                    merge::add_category(&mut self.categories, &c.name);
                }
                MenuAction::DeleteCategory(c) => {
                    merge::remove_category(&mut self.categories, &c.name);
                }
            },
            Payload::UpdateSettings(partial) => match &mut self.settings {
                Some(current) => current.merge(partial),
                None => self.settings = Some(partial.clone()),
            },
            Payload::UpdateUsers(action) => match action {
                UserAction::Add(u) => {
                    merge::insert(&mut self.users, u.clone(), policy.users);
                }
                UserAction::Update(u) => {
                    merge::upsert(&mut self.users, u.clone());
                }
                UserAction::Delete(r) => {
                    merge::remove_by_key(&mut self.users, &r.id);
                }
            },
            Payload::UserSync(UserSyncAction::BroadcastUsers { users, .. })
            | Payload::UserSync(UserSyncAction::UsersResponse { users }) => {
                self.users = users.clone();
            }
            Payload::SessionUpdate(batch) | Payload::SessionSync(batch) => {
                merge::replace_sessions(
                    &mut self.active_sessions,
                    &batch.sessions,
                    batch.from_client.as_deref(),
                );
            }
            Payload::UserLogin(session) => {
                merge::upsert(&mut self.active_sessions, session.clone());
            }
            Payload::UserLogout(notice) => {
                merge::remove_by_key(&mut self.active_sessions, &notice.client_id);
            }
            _ => {}
        }
    }

    fn record(&mut self, msg: &SyncMessage) {
        self.next_seq += 1;
        let data = msg.payload.to_data().unwrap_or(Value::Null);
        self.sync_log.push(SyncLogEntry {
            seq: self.next_seq,
            message_type: msg.message_type().as_str().to_string(),
            action: msg.payload.action().to_string(),
            client_id: msg.client_id.clone(),
            timestamp: msg.timestamp,
            data,
        });
        if let Some(limit) = self.sync_log_limit {
            if self.sync_log.len() > limit {
                let excess = self.sync_log.len() - limit;
                self.sync_log.drain(..excess);
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: Some(self.tables.clone()),
            menu_items: Some(self.menu_items.clone()),
            categories: Some(self.categories.clone()),
            settings: self.settings.clone(),
            order_history: Some(self.order_history.clone()),
            active_sessions: Some(self.active_sessions.clone()),
            users: Some(self.users.clone()),
        }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn active_sessions(&self) -> &[ActiveSession] {
        &self.active_sessions
    }

    pub fn order_history(&self) -> &[OrderHistoryEntry] {
        &self.order_history
    }

    pub fn sync_log(&self) -> &[SyncLogEntry] {
        &self.sync_log
    }

    /// Mutations relayed since startup, including ones trimmed from the log.
    pub fn mutation_count(&self) -> u64 {
        self.next_seq
    }
}
