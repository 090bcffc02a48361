//! Fan-out of relay frames to connected terminals.
//!
//! Uses one tokio broadcast channel for the whole relay. Every frame carries
//! its origin connection and an optional target; each connection task keeps
//! only the frames meant for it. Because all frames go through one channel,
//! every connection observes relay output in the order the relay produced it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, SyncMessage};

/// Relay-assigned connection id.
pub type ConnId = u64;

/// A connected socket.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub conn_id: ConnId,
    pub addr: Option<SocketAddr>,
    /// Client id announced by the terminal, once known.
    pub client_id: Option<String>,
    /// Epoch milliseconds
    pub connected_at: i64,
}

impl PeerInfo {
    pub fn new(conn_id: ConnId, addr: Option<SocketAddr>) -> Self {
        Self {
            conn_id,
            addr,
            client_id: None,
            connected_at: crate::protocol::now_millis(),
        }
    }

    /// Display id used in the relay's acknowledgement frame.
    pub fn connection_id(&self) -> String {
        format!("conn_{}", self.conn_id)
    }
}

/// An encoded frame plus its routing.
#[derive(Debug)]
pub struct Frame {
    /// Connection the frame came from (excluded from delivery).
    pub origin: Option<ConnId>,
    /// Deliver only to this connection.
    pub target: Option<ConnId>,
    pub text: String,
}

impl Frame {
    pub fn is_for(&self, conn_id: ConnId) -> bool {
        match self.target {
            Some(target) => target == conn_id,
            None => self.origin != Some(conn_id),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// All connected terminals of one relay.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,

    peers: Arc<RwLock<HashMap<ConnId, PeerInfo>>>,

    next_conn_id: AtomicU64,

    /// Frames buffered per receiver before a slow connection starts lagging
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Registers a new connection and returns its info plus a receiver.
    pub async fn add_peer(&self, addr: Option<SocketAddr>) -> (PeerInfo, broadcast::Receiver<Arc<Frame>>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let info = PeerInfo::new(conn_id, addr);
        let rx = self.sender.subscribe();
        self.peers.write().await.insert(conn_id, info.clone());
        (info, rx)
    }

    pub async fn remove_peer(&self, conn_id: ConnId) -> Option<PeerInfo> {
        self.peers.write().await.remove(&conn_id)
    }

    /// Records the client id a connection announced.
    pub async fn identify(&self, conn_id: ConnId, client_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(&conn_id) {
            if peer.client_id.as_deref() != Some(client_id) {
                peer.client_id = Some(client_id.to_string());
            }
        }
    }

    /// Broadcast to every connection except `origin`.
    pub fn broadcast(&self, msg: &SyncMessage, origin: Option<ConnId>) -> Result<usize, ProtocolError> {
        let text = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Frame {
            origin,
            target: None,
            text,
        })))
    }

    /// Send to a single connection.
    pub fn send_to(&self, conn_id: ConnId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let text = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Frame {
            origin: None,
            target: Some(conn_id),
            text,
        })))
    }

    /// Pre-encoded fast path. Returns the number of receivers.
    pub fn broadcast_raw(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Called by a connection task that fell behind by `n` frames.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, conn_id: ConnId) -> bool {
        self.peers.read().await.contains_key(&conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
