//! Keyed publish/subscribe.
//!
//! Handlers are registered per key and invoked synchronously in
//! registration order. A panicking handler is logged and skipped; the
//! remaining handlers still run. Publishing never holds the registry lock
//! while a handler runs, so handlers may subscribe or unsubscribe.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus<K, E> {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<K, Vec<(SubscriptionId, Handler<E>)>>>,
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, key: K, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(key).or_default().push((id, handler));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Delivers `event` to every handler on `key`. Returns how many handlers
    /// completed without panicking.
    pub fn publish(&self, key: &K, event: &E) -> usize {
        let targets: Vec<Handler<E>> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(key) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for handler in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => log::error!("Event handler for {:?} panicked; continuing", key),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(key).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
