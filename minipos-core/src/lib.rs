//! # minipos-core: Shared data model for MiniPOS terminals
//!
//! Everything a terminal and the relay agree on: the record types that make
//! up restaurant state, the merge rules that fold remote updates into a local
//! copy, the per-day order identifier allocator, and the key/value storage
//! the terminal persists through.
//!
//! ## Layout
//!
//! ```text
//!   model ──► merge ──► (relay mirror / terminal reconciler)
//!     │
//!     ├──► order ──► order_id (allocation, parsing)
//!     │
//!     └──► store (persisted collections) ◄── defaults (first run)
//!
//!   observer: keyed publish/subscribe used by both sides
//! ```
//!
//! ## Modules
//!
//! - [`model`]: tables, menu items, settings, sessions, users
//! - [`order`]: order history entries and their persisted form
//! - [`merge`]: upsert / remove / partial-replace rules
//! - [`order_id`]: `POS-MMDDYYYY-NNN` allocation with pending reservations
//! - [`store`]: `KeyValueStore` trait, in-memory and file backends
//! - [`observer`]: keyed event bus with unsubscribe handles
//! - [`defaults`]: first-run seed data

pub mod defaults;
pub mod merge;
pub mod model;
pub mod observer;
pub mod order;
pub mod order_id;
pub mod store;

pub use merge::{AddPolicy, Keyed, MergePolicy};
pub use model::{ActiveSession, CategoryRef, EntityRef, MenuItem, Settings, Table, TableStatus, User};
pub use observer::{EventBus, Handler, SubscriptionId};
pub use order::{OrderHistoryEntry, OrderItems};
pub use order_id::{AllocatorConfig, Clock, ManualClock, OrderId, OrderIdAllocator, SystemClock};
pub use store::{FileStore, KeyValueStore, KeyValueStoreExt, MemoryStore, StoreError};
