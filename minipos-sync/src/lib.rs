//! # minipos-sync: Multi-terminal synchronization for MiniPOS
//!
//! Keeps every terminal in a restaurant looking at the same tables, menu,
//! orders, users and sessions by relaying JSON frames through one central
//! server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncChannel │ ◄─────────────────► │ RelayServer │
//! │ (terminal)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Reconciler  │                     │ Mirror      │
//! │ (persisted) │                     │ (snapshot)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message types, payloads and the JSON envelope
//! - [`broadcast`]: fan-out to every connection but the sender
//! - [`mirror`]: the relay's in-memory copy of shared state
//! - [`relay`] / [`server`]: frame routing and the WebSocket listener
//! - [`client`]: reconnecting channel with an outbound queue
//! - [`reconciler`]: folds remote frames into persisted local state
//! - [`session`]: login, logout, refresh and termination messages
//! - [`node`]: one terminal with all of the above wired together

pub mod broadcast;
pub mod client;
pub mod error;
pub mod mirror;
pub mod node;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnId, PeerInfo};
pub use client::{
    ChannelConfig, ChannelEvent, ChannelEventKind, ChannelStats, ConnectionState, Delivery, SyncChannel,
};
pub use error::{RelayError, SyncError};
pub use mirror::{Mirror, SyncLogEntry};
pub use node::{NodeConfig, PosNode};
pub use protocol::{MessageType, Payload, ProtocolError, Snapshot, SyncMessage};
pub use reconciler::{ChangeTopic, Collection, LocalState, Reconciler, StateChange};
pub use relay::RelayHub;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{DeviceInfo, SessionConfig, SessionDirective, SessionProtocol};
