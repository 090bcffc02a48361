//! Folds remote changes and relay snapshots into a terminal's local state.
//!
//! Every successful apply persists the new collection first, then swaps the
//! in-memory copy, then notifies observers with the new value. A failed
//! write leaves both the store and the cache as they were.
//!
//! Observers run while the reconciler is borrowed. They get the new value
//! and must not call back into the reconciler.

use chrono::Utc;
use serde::de::DeserializeOwned;

use minipos_core::merge::{self, MergePolicy};
use minipos_core::order::{self, OrderHistoryEntry};
use minipos_core::store::keys;
use minipos_core::{
    defaults, ActiveSession, EventBus, Handler, KeyValueStore, KeyValueStoreExt, MenuItem, Settings, SubscriptionId,
    Table, User,
};

use crate::error::SyncError;
use crate::protocol::{
    LogoutNotice, MenuAction, OrderAction, Payload, SessionBatch, Snapshot, SyncMessage, TableAction, UserAction,
    UserSyncAction,
};
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Tables,
    MenuItems,
    Categories,
    Settings,
    OrderHistory,
    Users,
    ActiveSessions,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Tables,
        Collection::MenuItems,
        Collection::Categories,
        Collection::Settings,
        Collection::OrderHistory,
        Collection::Users,
        Collection::ActiveSessions,
    ];

    pub fn storage_key(&self) -> &'static str {
        match self {
            Collection::Tables => keys::TABLES,
            Collection::MenuItems => keys::MENU_ITEMS,
            Collection::Categories => keys::CATEGORIES,
            Collection::Settings => keys::SETTINGS,
            Collection::OrderHistory => keys::ORDER_HISTORY,
            Collection::Users => keys::USERS,
            Collection::ActiveSessions => keys::ACTIVE_SESSIONS,
        }
    }
}

/// In-memory copy of everything a terminal persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub tables: Vec<Table>,
    pub menu_items: Vec<MenuItem>,
    pub categories: Vec<String>,
    pub settings: Settings,
    pub order_history: Vec<OrderHistoryEntry>,
    pub users: Vec<User>,
    pub active_sessions: Vec<ActiveSession>,
}

impl LocalState {
    /// Every order id this terminal knows about: history plus ids still
    /// held by tables.
    pub fn known_order_ids(&self) -> Vec<&str> {
        self.order_history
            .iter()
            .map(|o| o.id.as_str())
            .chain(self.tables.iter().filter_map(|t| t.order_id.as_deref()))
            .collect()
    }
}

/// What observers are told.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Tables(Vec<Table>),
    MenuItems(Vec<MenuItem>),
    Categories(Vec<String>),
    Settings(Settings),
    OrderHistory(Vec<OrderHistoryEntry>),
    Users(Vec<User>),
    ActiveSessions(Vec<ActiveSession>),
    /// This terminal's session was ended remotely; state has been reloaded.
    Terminated { reason: Option<String>, forced: bool },
    /// All collections were re-read from the store.
    Reloaded,
}

/// Subscription keys for [`StateChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTopic {
    Collection(Collection),
    Terminated,
    Reloaded,
}

impl StateChange {
    pub fn topic(&self) -> ChangeTopic {
        match self {
            StateChange::Tables(_) => ChangeTopic::Collection(Collection::Tables),
            StateChange::MenuItems(_) => ChangeTopic::Collection(Collection::MenuItems),
            StateChange::Categories(_) => ChangeTopic::Collection(Collection::Categories),
            StateChange::Settings(_) => ChangeTopic::Collection(Collection::Settings),
            StateChange::OrderHistory(_) => ChangeTopic::Collection(Collection::OrderHistory),
            StateChange::Users(_) => ChangeTopic::Collection(Collection::Users),
            StateChange::ActiveSessions(_) => ChangeTopic::Collection(Collection::ActiveSessions),
            StateChange::Terminated { .. } => ChangeTopic::Terminated,
            StateChange::Reloaded => ChangeTopic::Reloaded,
        }
    }
}

/// Reads one collection, treating unreadable data as absent.
fn load_or_default<S, T>(store: &S, key: &str) -> T
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned + Default,
{
    match store.load::<T>(key) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            log::warn!("Discarding unreadable '{key}': {e}");
            T::default()
        }
    }
}

fn load_state<S: KeyValueStore + ?Sized>(store: &S) -> LocalState {
    let mut order_history: Vec<OrderHistoryEntry> = load_or_default(store, keys::ORDER_HISTORY);
    order::sort_newest_first(&mut order_history);
    LocalState {
        tables: load_or_default(store, keys::TABLES),
        menu_items: load_or_default(store, keys::MENU_ITEMS),
        categories: load_or_default(store, keys::CATEGORIES),
        settings: load_or_default(store, keys::SETTINGS),
        order_history,
        users: load_or_default(store, keys::USERS),
        active_sessions: load_or_default(store, keys::ACTIVE_SESSIONS),
    }
}

pub struct Reconciler<S: KeyValueStore> {
    store: S,
    state: LocalState,
    policy: MergePolicy,
    observers: EventBus<ChangeTopic, StateChange>,
}

impl<S: KeyValueStore> Reconciler<S> {
    /// Loads whatever the store holds. Collections that are missing or fail
    /// to parse start empty.
    pub fn open(store: S, policy: MergePolicy) -> Self {
        let state = load_state(&store);
        log::debug!(
            "Loaded local state: {} tables, {} menu items, {} orders, {} users",
            state.tables.len(),
            state.menu_items.len(),
            state.order_history.len(),
            state.users.len()
        );
        Self {
            store,
            state,
            policy,
            observers: EventBus::new(),
        }
    }

    /// Writes first-run defaults into every empty collection. Returns the
    /// collections that were seeded.
    pub fn seed_defaults(&mut self) -> Result<Vec<Collection>, SyncError> {
        let mut seeded = Vec::new();
        if self.state.settings.is_empty() {
            self.commit_settings(defaults::settings())?;
            seeded.push(Collection::Settings);
        }
        if self.state.categories.is_empty() {
            self.commit_categories(defaults::categories())?;
            seeded.push(Collection::Categories);
        }
        if self.state.tables.is_empty() {
            self.commit_tables(defaults::tables())?;
            seeded.push(Collection::Tables);
        }
        if self.state.menu_items.is_empty() {
            self.commit_menu_items(defaults::menu_items())?;
            seeded.push(Collection::MenuItems);
        }
        if self.state.users.is_empty() {
            self.commit_users(defaults::users())?;
            seeded.push(Collection::Users);
        }
        if !seeded.is_empty() {
            log::info!("Seeded defaults for {seeded:?}");
        }
        Ok(seeded)
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn subscribe(&self, topic: ChangeTopic, handler: Handler<StateChange>) -> SubscriptionId {
        self.observers.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn known_order_ids(&self) -> Vec<String> {
        self.state.known_order_ids().into_iter().map(str::to_string).collect()
    }

    /// Applies a frame received from the relay. Failures are logged and
    /// contained; the return value says whether local state changed.
    pub fn apply_remote(&mut self, msg: &SyncMessage) -> bool {
        match self.apply_payload(&msg.payload) {
            Ok(changed) => {
                if changed {
                    log::debug!("Applied {} ({}) from {}", msg.message_type(), msg.payload.action(), msg.client_id);
                }
                changed
            }
            Err(e) => {
                log::error!("Failed to apply {} from {}: {e}", msg.message_type(), msg.client_id);
                false
            }
        }
    }

    /// Applies a payload to local state, whether it came from the relay or
    /// from a local action.
    pub fn apply_payload(&mut self, payload: &Payload) -> Result<bool, SyncError> {
        match payload {
            Payload::SyncResponse(snapshot) => Ok(!self.apply_snapshot(snapshot).is_empty()),
            Payload::UpdateTable(action) => self.apply_table(action),
            Payload::UpdateOrder(action) => self.apply_order(action),
            Payload::UpdateMenu(action) => self.apply_menu(action),
            Payload::UpdateSettings(partial) => self.apply_settings(partial).map(|_| true),
            Payload::UpdateUsers(action) => self.apply_users(action),
            Payload::UserSync(action) => self.apply_user_sync(action),
            Payload::SessionUpdate(batch) | Payload::SessionSync(batch) => self.apply_sessions(batch).map(|_| true),
            Payload::UserLogin(session) => self.apply_login(session).map(|_| true),
            Payload::UserLogout(notice) => self.apply_logout(notice),
            _ => Ok(false),
        }
    }

    pub fn apply_table(&mut self, action: &TableAction) -> Result<bool, SyncError> {
        if let TableAction::Add(table) | TableAction::Update(table) = action {
            // Kept as sent so terminals converge; local edits are refused
            // before they get here.
            if !table.is_consistent() {
                log::warn!("Table '{}' is occupied with items but no order id", table.id);
            }
        }
        let mut tables = self.state.tables.clone();
        let changed = match action {
            TableAction::Add(table) => merge::insert(&mut tables, table.clone(), self.policy.tables),
            TableAction::Update(table) => {
                merge::upsert(&mut tables, table.clone());
                true
            }
            TableAction::Delete(r) => merge::remove_by_key(&mut tables, &r.id),
        };
        if changed {
            self.commit_tables(tables)?;
        }
        Ok(changed)
    }

    pub fn apply_order(&mut self, action: &OrderAction) -> Result<bool, SyncError> {
        let history = match action {
            OrderAction::Add(entry) => {
                let mut history = self.state.order_history.clone();
                merge::add_order(&mut history, entry.clone(), Utc::now());
                history
            }
            OrderAction::Clear => Vec::new(),
        };
        self.commit_order_history(history)?;
        Ok(true)
    }

    pub fn apply_menu(&mut self, action: &MenuAction) -> Result<bool, SyncError> {
        match action {
            MenuAction::AddItem(_) | MenuAction::UpdateItem(_) | MenuAction::DeleteItem(_) => {
                let mut items = self.state.menu_items.clone();
                let changed = match action {
                    MenuAction::AddItem(item) => merge::insert(&mut items, item.clone(), self.policy.menu_items),
                    MenuAction::UpdateItem(item) => {
                        merge::upsert(&mut items, item.clone());
                        true
                    }
                    MenuAction::DeleteItem(r) => merge::remove_by_key(&mut items, &r.id),
                    _ => false,
                };
                if changed {
                    self.commit_menu_items(items)?;
                }
                Ok(changed)
            }
            MenuAction::AddCategory(c) | MenuAction::DeleteCategory(c) => {
                let mut categories = self.state.categories.clone();
                let changed = if matches!(action, MenuAction::AddCategory(_)) {
                    merge::add_category(&mut categories, &c.name)
                } else {
                    merge::remove_category(&mut categories, &c.name)
                };
                if changed {
                    self.commit_categories(categories)?;
                }
                Ok(changed)
            }
        }
    }

    /// Shallow merge: incoming fields overwrite, the rest are kept.
    pub fn apply_settings(&mut self, partial: &Settings) -> Result<(), SyncError> {
        let mut settings = self.state.settings.clone();
        settings.merge(partial);
        self.commit_settings(settings)
    }

    pub fn apply_users(&mut self, action: &UserAction) -> Result<bool, SyncError> {
        let mut users = self.state.users.clone();
        let changed = match action {
            UserAction::Add(user) => merge::insert(&mut users, user.clone(), self.policy.users),
            UserAction::Update(user) => {
                merge::upsert(&mut users, user.clone());
                true
            }
            UserAction::Delete(r) => merge::remove_by_key(&mut users, &r.id),
        };
        if changed {
            self.commit_users(users)?;
        }
        Ok(changed)
    }

    /// `users_response` and `broadcast_users` replace the whole user list.
    pub fn apply_user_sync(&mut self, action: &UserSyncAction) -> Result<bool, SyncError> {
        match action {
            UserSyncAction::UsersResponse { users } | UserSyncAction::BroadcastUsers { users, .. } => {
                self.commit_users(users.clone())?;
                Ok(true)
            }
            UserSyncAction::RequestUsers { .. } => Ok(false),
        }
    }

    pub fn apply_sessions(&mut self, batch: &SessionBatch) -> Result<(), SyncError> {
        let mut sessions = self.state.active_sessions.clone();
        merge::replace_sessions(&mut sessions, &batch.sessions, batch.from_client.as_deref());
        self.commit_sessions(sessions)
    }

    pub fn apply_login(&mut self, session: &ActiveSession) -> Result<(), SyncError> {
        let mut sessions = self.state.active_sessions.clone();
        merge::upsert(&mut sessions, session.clone());
        self.commit_sessions(sessions)
    }

    pub fn apply_logout(&mut self, notice: &LogoutNotice) -> Result<bool, SyncError> {
        let mut sessions = self.state.active_sessions.clone();
        let changed = merge::remove_by_key(&mut sessions, &notice.client_id);
        if changed {
            self.commit_sessions(sessions)?;
        }
        Ok(changed)
    }

    /// Folds a relay snapshot in. Tables, menu, categories, settings and
    /// sessions are overwritten; order history is merged by id with the
    /// relay's copy winning; users are taken only if the relay has any.
    /// A collection that fails to apply is logged and skipped. Returns the
    /// collections that were written.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Collection> {
        let mut applied = Vec::new();
        let mut record = |collection: Collection, result: Result<(), SyncError>| match result {
            Ok(()) => applied.push(collection),
            Err(e) => log::error!("Failed to apply snapshot {collection:?}: {e}"),
        };

        if let Some(tables) = &snapshot.tables {
            record(Collection::Tables, self.commit_tables(tables.clone()));
        }
        if let Some(items) = &snapshot.menu_items {
            record(Collection::MenuItems, self.commit_menu_items(items.clone()));
        }
        if let Some(categories) = &snapshot.categories {
            record(Collection::Categories, self.commit_categories(categories.clone()));
        }
        if let Some(settings) = &snapshot.settings {
            record(Collection::Settings, self.commit_settings(settings.clone()));
        }
        if let Some(server) = &snapshot.order_history {
            let merged = match self.store.load::<Vec<OrderHistoryEntry>>(keys::ORDER_HISTORY) {
                Ok(local) => merge::merge_order_history(local.unwrap_or_default(), server.clone()),
                Err(e) => {
                    log::warn!("Local order history unreadable, taking relay copy: {e}");
                    let mut server = server.clone();
                    order::sort_newest_first(&mut server);
                    server
                }
            };
            log::debug!("Order history merged: {} entries", merged.len());
            record(Collection::OrderHistory, self.commit_order_history(merged));
        }
        if let Some(users) = &snapshot.users {
            if !users.is_empty() {
                record(Collection::Users, self.commit_users(users.clone()));
            }
        }
        if let Some(sessions) = &snapshot.active_sessions {
            record(Collection::ActiveSessions, self.commit_sessions(sessions.clone()));
        }

        log::info!("Applied relay snapshot: {applied:?}");
        applied
    }

    /// Re-reads every collection from the store.
    pub fn reload(&mut self) {
        self.state = load_state(&self.store);
        self.observers.publish(&ChangeTopic::Reloaded, &StateChange::Reloaded);
    }

    /// Ends this terminal's session after a remote termination: credentials
    /// are cleared, the terminated flag is set, `client_id`'s session is
    /// dropped and everything is reloaded from the store.
    pub fn terminate_local_session(
        &mut self,
        client_id: &str,
        forced: bool,
        reason: Option<String>,
    ) -> Result<(), SyncError> {
        session::clear_credentials(&self.store, forced)?;
        self.store.save(keys::SESSION_TERMINATED, &true)?;

        let mut sessions = self.state.active_sessions.clone();
        if merge::remove_by_key(&mut sessions, client_id) {
            self.store.save(keys::ACTIVE_SESSIONS, &sessions)?;
        }

        log::warn!(
            "Session {client_id} terminated remotely{}",
            reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        );
        self.reload();
        self.observers
            .publish(&ChangeTopic::Terminated, &StateChange::Terminated { reason, forced });
        Ok(())
    }

    fn notify(&self, change: StateChange) {
        self.observers.publish(&change.topic(), &change);
    }

    fn commit_tables(&mut self, tables: Vec<Table>) -> Result<(), SyncError> {
        self.store.save(keys::TABLES, &tables)?;
        self.state.tables = tables;
        self.notify(StateChange::Tables(self.state.tables.clone()));
        Ok(())
    }

    fn commit_menu_items(&mut self, items: Vec<MenuItem>) -> Result<(), SyncError> {
        self.store.save(keys::MENU_ITEMS, &items)?;
        self.state.menu_items = items;
        self.notify(StateChange::MenuItems(self.state.menu_items.clone()));
        Ok(())
    }

    fn commit_categories(&mut self, categories: Vec<String>) -> Result<(), SyncError> {
        self.store.save(keys::CATEGORIES, &categories)?;
        self.state.categories = categories;
        self.notify(StateChange::Categories(self.state.categories.clone()));
        Ok(())
    }

    fn commit_settings(&mut self, settings: Settings) -> Result<(), SyncError> {
        self.store.save(keys::SETTINGS, &settings)?;
        self.state.settings = settings;
        self.notify(StateChange::Settings(self.state.settings.clone()));
        Ok(())
    }

    /// Persisted with `items` as a JSON string.
    fn commit_order_history(&mut self, history: Vec<OrderHistoryEntry>) -> Result<(), SyncError> {
        let raw = order::encode_for_storage(&history)?;
        self.store.set(keys::ORDER_HISTORY, &raw)?;
        self.state.order_history = history;
        self.notify(StateChange::OrderHistory(self.state.order_history.clone()));
        Ok(())
    }

    fn commit_users(&mut self, users: Vec<User>) -> Result<(), SyncError> {
        self.store.save(keys::USERS, &users)?;
        self.state.users = users;
        self.notify(StateChange::Users(self.state.users.clone()));
        Ok(())
    }

    fn commit_sessions(&mut self, sessions: Vec<ActiveSession>) -> Result<(), SyncError> {
        self.store.save(keys::ACTIVE_SESSIONS, &sessions)?;
        self.state.active_sessions = sessions;
        self.notify(StateChange::ActiveSessions(self.state.active_sessions.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionBatchKind;
    use minipos_core::{EntityRef, MemoryStore, StoreError};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn reconciler() -> Reconciler<MemoryStore> {
        Reconciler::open(MemoryStore::new(), MergePolicy::default())
    }

    fn order(id: &str, created_at: &str) -> OrderHistoryEntry {
        let mut o = OrderHistoryEntry::new(id, 1, 10.0, vec![json!({"name": "Tea"})]);
        o.created_at = Some(created_at.to_string());
        o
    }

    fn session(client_id: &str, user: &str) -> ActiveSession {
        ActiveSession {
            client_id: client_id.to_string(),
            user_name: user.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut r = reconciler();
        let update = Payload::UpdateTable(TableAction::Update(Table::new("5", 5, 4)));
        r.apply_payload(&update).unwrap();
        let once = r.state().tables.clone();
        r.apply_payload(&update).unwrap();
        assert_eq!(r.state().tables, once);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn test_apply_persists_then_notifies() {
        let mut r = reconciler();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        r.subscribe(
            ChangeTopic::Collection(Collection::Tables),
            Arc::new(move |change: &StateChange| {
                if let StateChange::Tables(t) = change {
                    sink.lock().unwrap().push(t.len());
                }
            }),
        );
        r.apply_table(&TableAction::Add(Table::new("1", 1, 2))).unwrap();
        let stored: Vec<Table> = r.store().load(keys::TABLES).unwrap().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        r.apply_table(&TableAction::Delete(EntityRef::new("1"))).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_order_clear_is_total() {
        let mut r = reconciler();
        for i in 0..50 {
            r.apply_order(&OrderAction::Add(OrderHistoryEntry::new(format!("o{i}"), 1, 1.0, vec![])))
                .unwrap();
        }
        assert_eq!(r.state().order_history.len(), 50);
        r.apply_order(&OrderAction::Clear).unwrap();
        assert!(r.state().order_history.is_empty());
    }

    #[test]
    fn test_order_items_string_normalized() {
        let mut r = reconciler();
        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();
        r.subscribe(
            ChangeTopic::Collection(Collection::OrderHistory),
            Arc::new(move |change: &StateChange| {
                if let StateChange::OrderHistory(h) = change {
                    *sink.lock().unwrap() = Some(h[0].items.clone());
                }
            }),
        );
        let raw = json!({
            "type": "UPDATE_ORDER",
            "data": {
                "action": "add",
                "data": {"id": "POS-01152025-001", "items": "[{\"name\":\"Tea\",\"quantity\":1}]"}
            },
            "timestamp": 1736930000000i64,
            "clientId": "client_b"
        })
        .to_string();
        assert!(r.apply_remote(&SyncMessage::decode(&raw).unwrap()));

        let items = received.lock().unwrap().clone().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items.0[0]["name"], "Tea");

        // persisted form keeps the string representation
        let stored = r.store().get(keys::ORDER_HISTORY).unwrap().unwrap();
        let rows: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert!(rows[0]["items"].is_string());
    }

    #[test]
    fn test_partial_session_replace() {
        let mut r = reconciler();
        r.apply_login(&session("a", "")).unwrap();
        r.apply_login(&session("b", "")).unwrap();
        r.apply_sessions(&SessionBatch::new(SessionBatchKind::ListUpdated, vec![session("a", "X")], None))
            .unwrap();
        assert_eq!(r.state().active_sessions, vec![session("b", ""), session("a", "X")]);
    }

    #[test]
    fn test_broadcast_users_replaces_all() {
        let mut r = reconciler();
        for id in ["u1", "u2", "u3"] {
            r.apply_users(&UserAction::Add(User::new(id, id, "waiter"))).unwrap();
        }
        r.apply_user_sync(&UserSyncAction::BroadcastUsers {
            users: vec![User::new("u4", "dan", "admin")],
            from_client: None,
        })
        .unwrap();
        let ids: Vec<_> = r.state().users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u4"]);
    }

    #[test]
    fn test_duplicate_user_add_ignored() {
        let mut r = reconciler();
        assert!(r.apply_users(&UserAction::Add(User::new("u1", "ann", "waiter"))).unwrap());
        assert!(!r.apply_users(&UserAction::Add(User::new("u1", "bob", "admin"))).unwrap());
        assert_eq!(r.state().users[0].username, "ann");
    }

    #[test]
    fn test_settings_shallow_merge() {
        let mut r = reconciler();
        r.seed_defaults().unwrap();
        r.apply_settings(&Settings::new().with("taxRate", 8.0)).unwrap();
        assert_eq!(r.state().settings.tax_rate(), Some(8.0));
        assert_eq!(r.state().settings.currency(), Some("MMK"));
    }

    #[test]
    fn test_menu_and_categories() {
        let mut r = reconciler();
        r.apply_menu(&MenuAction::AddItem(MenuItem::new("m1", "Tea", 1.5, "Drinks"))).unwrap();
        r.apply_menu(&MenuAction::AddCategory(minipos_core::CategoryRef { name: "Drinks".into() }))
            .unwrap();
        assert!(!r
            .apply_menu(&MenuAction::AddCategory(minipos_core::CategoryRef { name: "Drinks".into() }))
            .unwrap());
        assert_eq!(r.state().categories, vec!["Drinks"]);
        r.apply_menu(&MenuAction::DeleteItem(EntityRef::new("m1"))).unwrap();
        assert!(r.state().menu_items.is_empty());
    }

    #[test]
    fn test_snapshot_merges_order_history() {
        let mut r = reconciler();
        r.apply_order(&OrderAction::Add(order("local-only", "2025-01-15T10:00:00.000Z"))).unwrap();
        let mut both = order("shared", "2025-01-15T09:00:00.000Z");
        both.total = 1.0;
        r.apply_order(&OrderAction::Add(both)).unwrap();

        let mut server_copy = order("shared", "2025-01-15T09:00:00.000Z");
        server_copy.total = 99.0;
        let snapshot = Snapshot {
            order_history: Some(vec![server_copy, order("server-only", "2025-01-15T11:00:00.000Z")]),
            tables: Some(vec![Table::new("9", 9, 2)]),
            users: Some(vec![]),
            ..Default::default()
        };
        r.seed_defaults().unwrap();
        let applied = r.apply_snapshot(&snapshot);
        assert!(applied.contains(&Collection::OrderHistory));
        assert!(!applied.contains(&Collection::Users));

        let ids: Vec<_> = r.state().order_history.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["server-only", "local-only", "shared"]);
        assert_eq!(r.state().order_history[2].total, 99.0);
        assert_eq!(r.state().tables.len(), 1);
        // empty relay user list keeps local users
        assert_eq!(r.state().users.len(), 3);
    }

    #[test]
    fn test_snapshot_with_unreadable_local_history_takes_server() {
        let store = MemoryStore::new();
        store.set(keys::ORDER_HISTORY, "{broken").unwrap();
        let mut r = Reconciler::open(store, MergePolicy::default());
        assert!(r.state().order_history.is_empty());

        r.apply_snapshot(&Snapshot {
            order_history: Some(vec![order("s1", "2025-01-15T11:00:00.000Z")]),
            ..Default::default()
        });
        assert_eq!(r.state().order_history.len(), 1);
    }

    #[test]
    fn test_seed_defaults_only_fills_empty() {
        let mut r = reconciler();
        r.apply_table(&TableAction::Add(Table::new("x", 1, 2))).unwrap();
        let seeded = r.seed_defaults().unwrap();
        assert!(!seeded.contains(&Collection::Tables));
        assert_eq!(r.state().tables.len(), 1);
        assert_eq!(r.state().users.len(), 3);
        assert!(r.seed_defaults().unwrap().is_empty());
    }

    #[test]
    fn test_known_order_ids_include_tables() {
        let mut r = reconciler();
        r.apply_order(&OrderAction::Add(order("POS-01152025-001", "2025-01-15T10:00:00.000Z")))
            .unwrap();
        let mut t = Table::new("1", 1, 2);
        t.order_id = Some("POS-01152025-002".into());
        r.apply_table(&TableAction::Add(t)).unwrap();
        let ids = r.known_order_ids();
        assert!(ids.contains(&"POS-01152025-001".to_string()));
        assert!(ids.contains(&"POS-01152025-002".to_string()));
    }

    #[test]
    fn test_remote_inconsistent_table_still_applied() {
        let mut r = reconciler();
        let mut t = Table::new("3", 3, 4);
        t.occupy("POS-01152025-003", None, vec![json!({"name": "Tea"})], 3.0);
        t.order_id = None;
        assert!(!t.is_consistent());

        let msg = SyncMessage::new(Payload::UpdateTable(TableAction::Update(t)), "client_peer");
        assert!(r.apply_remote(&msg));
        let stored = r.state().tables.iter().find(|t| t.id == "3").unwrap();
        assert!(stored.order_id.is_none());
    }

    #[test]
    fn test_terminate_local_session() {
        let mut r = reconciler();
        r.seed_defaults().unwrap();
        let admin = r.state().users[0].clone();
        session::save_credentials(r.store(), &admin).unwrap();
        r.store().save(keys::ACTIVE_TAB, &"reports").unwrap();
        r.apply_login(&session("me", "Admin User")).unwrap();
        r.apply_login(&session("other", "Cashier User")).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        r.subscribe(
            ChangeTopic::Terminated,
            Arc::new(move |change: &StateChange| sink.lock().unwrap().push(change.clone())),
        );

        r.terminate_local_session("me", true, Some("Shift over".into())).unwrap();
        assert!(!r.store().contains(keys::IS_LOGGED_IN).unwrap());
        assert!(!r.store().contains(keys::ACTIVE_TAB).unwrap());
        assert_eq!(r.store().load::<bool>(keys::SESSION_TERMINATED).unwrap(), Some(true));
        let ids: Vec<_> = r.state().active_sessions.iter().map(|s| s.client_id.as_str()).collect();
        assert_eq!(ids, vec!["other"]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![StateChange::Terminated {
                reason: Some("Shift over".into()),
                forced: true
            }]
        );
    }

    /// Store that refuses writes.
    struct ReadOnlyStore(MemoryStore);

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key)
        }
        fn set(&self, key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::InvalidKey(key.to_string()))
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.0.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.0.keys()
        }
    }

    #[test]
    fn test_failed_write_leaves_cache_untouched() {
        let mut r = Reconciler::open(ReadOnlyStore(MemoryStore::new()), MergePolicy::default());
        let err = r.apply_table(&TableAction::Add(Table::new("1", 1, 2)));
        assert!(matches!(err, Err(SyncError::Store(_))));
        assert!(r.state().tables.is_empty());

        let msg = SyncMessage::new(Payload::UpdateTable(TableAction::Add(Table::new("1", 1, 2))), "client_b");
        assert!(!r.apply_remote(&msg));
    }
}
