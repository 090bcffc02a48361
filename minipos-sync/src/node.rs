//! One running terminal: channel, reconciler, order ids and sessions wired
//! together.
//!
//! ```text
//! local action ──► Reconciler (persist + notify) ──► SyncChannel ──► relay
//! relay frame  ──► SyncChannel ──► SessionProtocol ──► Reconciler (persist + notify)
//! ```
//!
//! Local actions apply to local state first and only then go on the wire,
//! so a terminal keeps working when the relay is unreachable.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use minipos_core::merge::MergePolicy;
use minipos_core::{
    AllocatorConfig, CategoryRef, EntityRef, Handler, KeyValueStore, MenuItem, OrderHistoryEntry, OrderIdAllocator,
    Settings, SubscriptionId, Table, User,
};

use crate::client::{ChannelConfig, ChannelEvent, ChannelEventKind, SyncChannel};
use crate::error::SyncError;
use crate::protocol::{LogoutNotice, MenuAction, OrderAction, Payload, SyncMessage, TableAction, UserAction};
use crate::reconciler::{ChangeTopic, LocalState, Reconciler, StateChange};
use crate::session::{self, SessionConfig, SessionDirective, SessionProtocol};

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub channel: ChannelConfig,
    pub session: SessionConfig,
    pub allocator: AllocatorConfig,
    pub merge_policy: MergePolicy,
    /// Fill empty collections with first-run defaults on start
    pub seed_defaults: bool,
}

type SharedReconciler<S> = Arc<Mutex<Reconciler<S>>>;
type SharedUser = Arc<Mutex<Option<User>>>;

/// Local edits may not seat items without an order id.
fn ensure_consistent(table: &Table) -> Result<(), SyncError> {
    if table.is_consistent() {
        Ok(())
    } else {
        Err(SyncError::InconsistentTable(table.id.clone()))
    }
}

fn lock<S: KeyValueStore>(reconciler: &Mutex<Reconciler<S>>) -> MutexGuard<'_, Reconciler<S>> {
    reconciler.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs `f` after `delay` on the current runtime, or right away without one.
fn run_later(delay: Duration, f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                f();
            });
        }
        Err(_) => {
            log::debug!("No async runtime, running deferred send now");
            f();
        }
    }
}

pub struct PosNode<S: KeyValueStore + 'static> {
    channel: SyncChannel,
    reconciler: SharedReconciler<S>,
    allocator: Mutex<OrderIdAllocator>,
    sessions: SessionProtocol,
    current_user: SharedUser,
    subscription: SubscriptionId,
}

impl<S: KeyValueStore + 'static> PosNode<S> {
    pub fn new(store: S, config: NodeConfig) -> Result<Self, SyncError> {
        Self::with_channel(store, SyncChannel::new(config.channel.clone()), config)
    }

    /// Uses an existing channel, e.g. one with a fixed client id.
    pub fn with_channel(store: S, channel: SyncChannel, config: NodeConfig) -> Result<Self, SyncError> {
        let mut reconciler = Reconciler::open(store, config.merge_policy);
        if config.seed_defaults {
            reconciler.seed_defaults()?;
        }
        let current_user = session::current_user(reconciler.store()).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable login state: {e}");
            None
        });
        let reconciler = Arc::new(Mutex::new(reconciler));
        let current_user = Arc::new(Mutex::new(current_user));
        let sessions = SessionProtocol::new(channel.client_id(), config.session.clone());

        let subscription = {
            let reconciler = reconciler.clone();
            let current_user = current_user.clone();
            let channel_ref = channel.clone();
            let sessions = sessions.clone();
            channel.subscribe(
                ChannelEventKind::AnyMessage,
                Arc::new(move |event: &ChannelEvent| {
                    if let ChannelEvent::Message(msg) = event {
                        handle_incoming(&reconciler, &current_user, &channel_ref, &sessions, msg);
                    }
                }),
            )
        };

        log::info!("Terminal {} ready", channel.client_id());
        Ok(Self {
            channel,
            reconciler,
            allocator: Mutex::new(OrderIdAllocator::new(config.allocator)),
            sessions,
            current_user,
            subscription,
        })
    }

    pub fn client_id(&self) -> &str {
        self.channel.client_id()
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn connect(&self) {
        self.channel.connect();
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Copy of the current local state.
    pub fn state(&self) -> LocalState {
        lock(&self.reconciler).state().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&LocalState) -> R) -> R {
        f(lock(&self.reconciler).state())
    }

    /// Handlers run while local state is locked and must not call back
    /// into the node.
    pub fn subscribe(&self, topic: ChangeTopic, handler: Handler<StateChange>) -> SubscriptionId {
        lock(&self.reconciler).subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.reconciler).unsubscribe(id)
    }

    pub fn request_sync(&self) -> Result<(), SyncError> {
        self.channel.request_sync()?;
        Ok(())
    }

    /// Applies locally, then sends.
    fn publish_local(&self, payload: Payload) -> Result<(), SyncError> {
        lock(&self.reconciler).apply_payload(&payload)?;
        self.channel.send(payload)?;
        Ok(())
    }

    // Tables

    pub fn add_table(&self, table: Table) -> Result<(), SyncError> {
        ensure_consistent(&table)?;
        self.publish_local(Payload::UpdateTable(TableAction::Add(table)))
    }

    pub fn update_table(&self, table: Table) -> Result<(), SyncError> {
        ensure_consistent(&table)?;
        self.publish_local(Payload::UpdateTable(TableAction::Update(table)))
    }

    pub fn delete_table(&self, id: &str) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateTable(TableAction::Delete(EntityRef::new(id))))
    }

    /// Clears the order on a table in one update.
    pub fn free_table(&self, id: &str) -> Result<Table, SyncError> {
        let mut table = self
            .with_state(|s| s.tables.iter().find(|t| t.id == id).cloned())
            .ok_or_else(|| SyncError::NotFound {
                collection: "table",
                id: id.to_string(),
            })?;
        table.free();
        self.update_table(table.clone())?;
        Ok(table)
    }

    // Menu

    pub fn add_menu_item(&self, item: MenuItem) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateMenu(MenuAction::AddItem(item)))
    }

    pub fn update_menu_item(&self, item: MenuItem) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateMenu(MenuAction::UpdateItem(item)))
    }

    pub fn delete_menu_item(&self, id: &str) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateMenu(MenuAction::DeleteItem(EntityRef::new(id))))
    }

    pub fn add_category(&self, name: &str) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateMenu(MenuAction::AddCategory(CategoryRef {
            name: name.to_string(),
        })))
    }

    pub fn delete_category(&self, name: &str) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateMenu(MenuAction::DeleteCategory(CategoryRef {
            name: name.to_string(),
        })))
    }

    // Settings

    pub fn update_settings(&self, partial: Settings) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateSettings(partial))
    }

    // Orders

    /// Reserves the next order id. Confirm it with [`record_order`] or
    /// give it back with [`release_order_id`].
    ///
    /// [`record_order`]: PosNode::record_order
    /// [`release_order_id`]: PosNode::release_order_id
    pub fn allocate_order_id(&self) -> String {
        let known = lock(&self.reconciler).known_order_ids();
        let mut allocator = self.allocator.lock().unwrap_or_else(|e| e.into_inner());
        allocator.allocate(known.iter().map(String::as_str))
    }

    pub fn release_order_id(&self, id: &str) -> bool {
        self.allocator.lock().unwrap_or_else(|e| e.into_inner()).release(id)
    }

    /// Adds a completed order to history, confirms its id and sends the
    /// stored copy (with `createdAt` set).
    pub fn record_order(&self, entry: OrderHistoryEntry) -> Result<OrderHistoryEntry, SyncError> {
        let id = entry.id.clone();
        let stored = {
            let mut reconciler = lock(&self.reconciler);
            reconciler.apply_order(&OrderAction::Add(entry))?;
            reconciler
                .state()
                .order_history
                .iter()
                .find(|o| o.id == id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound {
                    collection: "order",
                    id: id.clone(),
                })?
        };
        self.allocator.lock().unwrap_or_else(|e| e.into_inner()).confirm(&id);
        self.channel.send(Payload::UpdateOrder(OrderAction::Add(stored.clone())))?;
        Ok(stored)
    }

    pub fn clear_order_history(&self) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateOrder(OrderAction::Clear))
    }

    // Users

    pub fn add_user(&self, user: User) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateUsers(UserAction::Add(user)))?;
        self.schedule_user_broadcast();
        Ok(())
    }

    pub fn update_user(&self, user: User) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateUsers(UserAction::Update(user)))?;
        self.schedule_user_broadcast();
        Ok(())
    }

    pub fn delete_user(&self, id: &str) -> Result<(), SyncError> {
        self.publish_local(Payload::UpdateUsers(UserAction::Delete(EntityRef::new(id))))?;
        self.schedule_user_broadcast();
        Ok(())
    }

    pub fn request_users(&self) -> Result<(), SyncError> {
        self.channel.send(self.sessions.request_users())?;
        Ok(())
    }

    /// Follows a user change with the full list so that terminals which
    /// missed a single update converge.
    fn schedule_user_broadcast(&self) {
        let reconciler = self.reconciler.clone();
        let channel = self.channel.clone();
        let sessions = self.sessions.clone();
        run_later(self.sessions.config().user_broadcast_delay, move || {
            let users = lock(&reconciler).state().users.clone();
            if let Err(e) = channel.send(sessions.broadcast_users(users)) {
                log::error!("Failed to broadcast users: {e}");
            }
        });
    }

    // Sessions

    pub fn current_user(&self) -> Option<User> {
        self.current_user.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn login(&self, login: &str, password: &str) -> Result<User, SyncError> {
        let user = self
            .with_state(|s| session::authenticate(&s.users, login, password).cloned())
            .ok_or(SyncError::InvalidCredentials)?;

        session::save_credentials(lock(&self.reconciler).store(), &user)?;
        let active = self.sessions.session_for(&user);
        self.publish_local(self.sessions.login(active))?;
        *self.current_user.lock().unwrap_or_else(|e| e.into_inner()) = Some(user.clone());
        log::info!("{} logged in on {}", user.username, self.client_id());
        Ok(user)
    }

    pub fn logout(&self) -> Result<(), SyncError> {
        let user = self
            .current_user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SyncError::NotLoggedIn)?;
        session::clear_credentials(lock(&self.reconciler).store(), false)?;
        self.publish_local(self.sessions.logout(&user))?;
        log::info!("{} logged out on {}", user.username, self.client_id());
        Ok(())
    }

    pub fn refresh_sessions(&self) -> Result<(), SyncError> {
        self.channel.send(self.sessions.refresh_request())?;
        Ok(())
    }

    /// Ends another terminal's session and drops it from the local view.
    pub fn terminate_session(&self, target: &str, reason: Option<String>) -> Result<(), SyncError> {
        self.drop_session(target)?;
        self.channel.send(self.sessions.terminate(target, reason))?;
        Ok(())
    }

    pub fn force_logout(&self, target: &str, reason: Option<String>) -> Result<(), SyncError> {
        self.drop_session(target)?;
        self.channel.send(self.sessions.force_logout(target, reason))?;
        Ok(())
    }

    fn drop_session(&self, client_id: &str) -> Result<(), SyncError> {
        lock(&self.reconciler).apply_logout(&LogoutNotice {
            client_id: client_id.to_string(),
            ..Default::default()
        })?;
        Ok(())
    }
}

impl<S: KeyValueStore + 'static> Drop for PosNode<S> {
    fn drop(&mut self) {
        self.channel.unsubscribe(self.subscription);
        self.channel.disconnect();
    }
}

fn handle_incoming<S: KeyValueStore + 'static>(
    reconciler: &SharedReconciler<S>,
    current_user: &SharedUser,
    channel: &SyncChannel,
    sessions: &SessionProtocol,
    msg: &SyncMessage,
) {
    match sessions.directive_for(msg) {
        SessionDirective::Ignore => {}
        SessionDirective::Rebroadcast { delay } => {
            let reconciler = reconciler.clone();
            let channel = channel.clone();
            let sessions = sessions.clone();
            log::debug!("Answering session refresh from {} in {delay:?}", msg.client_id);
            run_later(delay, move || {
                let list = lock(&reconciler).state().active_sessions.clone();
                if let Err(e) = channel.send(sessions.session_update(list)) {
                    log::error!("Failed to send session list: {e}");
                }
            });
        }
        SessionDirective::Terminate { reason, forced } => {
            if let Some(user) = current_user.lock().unwrap_or_else(|e| e.into_inner()).take() {
                log::warn!("{} signed out by a remote terminal", user.username);
            }
            let result = lock(reconciler).terminate_local_session(sessions.client_id(), forced, reason);
            if let Err(e) = result {
                log::error!("Failed to end local session: {e}");
            }
            return;
        }
    }
    lock(reconciler).apply_remote(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use minipos_core::store::keys;
    use minipos_core::{KeyValueStoreExt, MemoryStore};
    use serde_json::json;

    fn node() -> PosNode<MemoryStore> {
        let channel = SyncChannel::with_client_id(ChannelConfig::new("ws://127.0.0.1:1/ws"), "client_me");
        let config = NodeConfig {
            seed_defaults: true,
            ..Default::default()
        };
        PosNode::with_channel(MemoryStore::new(), channel, config).unwrap()
    }

    fn remote(payload: Payload) -> String {
        SyncMessage::new(payload, "client_peer").encode().unwrap()
    }

    #[test]
    fn test_local_action_applies_and_queues() {
        let node = node();
        node.add_table(Table::new("t9", 9, 4)).unwrap();
        assert!(node.state().tables.iter().any(|t| t.id == "t9"));
        assert_eq!(node.channel().queued_len(), 1);
    }

    #[test]
    fn test_remote_frames_reach_local_state() {
        let node = node();
        node.channel()
            .dispatch_incoming(&remote(Payload::UpdateTable(TableAction::Add(Table::new("5", 5, 4)))));
        assert!(node.state().tables.iter().any(|t| t.id == "5"));
    }

    #[test]
    fn test_local_inconsistent_table_refused() {
        let node = node();
        let mut table = Table::new("t8", 8, 4);
        table.occupy("POS-01152025-001", None, vec![json!({"name": "Tea"})], 3.0);
        table.order_id = None;

        assert!(matches!(node.add_table(table.clone()), Err(SyncError::InconsistentTable(id)) if id == "t8"));
        assert!(matches!(node.update_table(table), Err(SyncError::InconsistentTable(_))));
        assert!(!node.state().tables.iter().any(|t| t.id == "t8"));
        assert_eq!(node.channel().queued_len(), 0);
    }

    #[test]
    fn test_order_ids_and_recording() {
        let node = node();
        let first = node.allocate_order_id();
        let second = node.allocate_order_id();
        assert_ne!(first, second);
        assert!(node.release_order_id(&second));

        let stored = node
            .record_order(OrderHistoryEntry::new(first.clone(), 1, 5.0, vec![json!({"name": "Tea"})]))
            .unwrap();
        assert!(stored.created_at.is_some());
        assert_eq!(node.allocate_order_id(), second);
    }

    #[test]
    fn test_free_table() {
        let node = node();
        let mut table = Table::new("t1", 1, 2);
        table.occupy("POS-01152025-001", Some("Kim".into()), vec![json!({"name": "Tea"})], 3.0);
        node.add_table(table).unwrap();
        let freed = node.free_table("t1").unwrap();
        assert!(freed.order_id.is_none());
        assert!(matches!(node.free_table("missing"), Err(SyncError::NotFound { .. })));
    }

    #[test]
    fn test_login_logout() {
        let node = node();
        assert!(matches!(node.login("admin", "nope"), Err(SyncError::InvalidCredentials)));
        let user = node.login("admin", "admin").unwrap();
        assert_eq!(node.current_user(), Some(user));
        assert_eq!(node.state().active_sessions.len(), 1);

        node.logout().unwrap();
        assert!(node.current_user().is_none());
        assert!(node.state().active_sessions.is_empty());
        assert!(matches!(node.logout(), Err(SyncError::NotLoggedIn)));
    }

    #[test]
    fn test_forced_logout_from_peer() {
        let node = node();
        node.login("cashier", "cashier").unwrap();
        let admin = SessionProtocol::new("client_peer", SessionConfig::default());
        node.channel()
            .dispatch_incoming(&remote(admin.force_logout("client_me", Some("Closing".into()))));

        assert_eq!(node.with_state(|s| s.active_sessions.len()), 0);
        assert!(node.current_user().is_none());
        assert!(matches!(node.logout(), Err(SyncError::NotLoggedIn)));
        let terminated = lock(&node.reconciler)
            .store()
            .load::<bool>(keys::SESSION_TERMINATED)
            .unwrap();
        assert_eq!(terminated, Some(true));
    }

    #[test]
    fn test_terminate_for_other_terminal_keeps_login() {
        let node = node();
        node.login("waiter", "waiter").unwrap();
        let admin = SessionProtocol::new("client_peer", SessionConfig::default());
        node.channel()
            .dispatch_incoming(&remote(admin.terminate("client_elsewhere", None)));
        assert_eq!(node.current_user().map(|u| u.username), Some("waiter".to_string()));

        node.channel()
            .dispatch_incoming(&remote(admin.terminate("client_me", None)));
        assert!(node.current_user().is_none());
    }

    #[tokio::test]
    async fn test_user_change_followed_by_full_list() {
        let mut config = NodeConfig {
            seed_defaults: true,
            ..Default::default()
        };
        config.session.user_broadcast_delay = Duration::from_millis(10);
        let channel = SyncChannel::with_client_id(ChannelConfig::new("ws://127.0.0.1:1/ws"), "client_me");
        let node = PosNode::with_channel(MemoryStore::new(), channel, config).unwrap();

        node.add_user(User::new("u9", "dana", "waiter")).unwrap();
        assert_eq!(node.channel().queued_len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.channel().queued_len(), 2);
    }
}
