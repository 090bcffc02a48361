//! Message routing for the relay, independent of sockets.
//!
//! ```text
//! frame ──► decode ──┬─ SYNC_REQUEST ──────► snapshot ──► requester
//!                    ├─ HEARTBEAT ─────────► pong ──────► requester
//!                    ├─ USER_SYNC request ─► users ─────► requester
//!                    ├─ mutation ──► Mirror ──► BroadcastGroup ──► everyone else
//!                    └─ malformed ─────────► error ─────► requester
//! ```
//!
//! The mirror lock is held across apply + broadcast, so the order in which
//! mutations reach the mirror is the order they are broadcast in.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::broadcast::{BroadcastGroup, ConnId, Frame, PeerInfo};
use crate::mirror::Mirror;
use crate::protocol::{ConnectionNotice, Payload, ProtocolError, Snapshot, SyncMessage, UserSyncAction};
use crate::server::{ServerConfig, ServerStats};

pub struct RelayHub {
    mirror: Mutex<Mirror>,
    group: BroadcastGroup,
    stats: RwLock<ServerStats>,
}

impl RelayHub {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            mirror: Mutex::new(Mirror::new(config.merge_policy).with_sync_log_limit(config.sync_log_limit)),
            group: BroadcastGroup::new(config.broadcast_capacity),
            stats: RwLock::new(ServerStats::default()),
        }
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Registers a socket and queues its acknowledgement frame.
    pub async fn connect(&self, addr: Option<SocketAddr>) -> (PeerInfo, broadcast::Receiver<Arc<Frame>>) {
        let (peer, rx) = self.group.add_peer(addr).await;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ack = SyncMessage::from_server(Payload::ClientConnected(ConnectionNotice {
            connection_id: Some(peer.connection_id()),
            status: Some("connected".to_string()),
            ..Default::default()
        }));
        if let Err(e) = self.group.send_to(peer.conn_id, &ack) {
            log::error!("Failed to encode acknowledgement for {}: {e}", peer.connection_id());
        }

        log::info!(
            "Client {} connected from {} ({} total)",
            peer.connection_id(),
            addr.map_or_else(|| "unknown".to_string(), |a| a.to_string()),
            self.group.peer_count().await
        );
        (peer, rx)
    }

    pub async fn disconnect(&self, conn_id: ConnId) {
        let Some(peer) = self.group.remove_peer(conn_id).await else {
            return;
        };
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        if let Some(client_id) = &peer.client_id {
            let notice = SyncMessage::from_server(Payload::ClientDisconnected(ConnectionNotice {
                client_id: Some(client_id.clone()),
                ..Default::default()
            }));
            if let Err(e) = self.group.broadcast(&notice, Some(conn_id)) {
                log::error!("Failed to broadcast disconnect of {client_id}: {e}");
            }
        }
        log::info!(
            "Client {} disconnected ({} remaining)",
            peer.connection_id(),
            self.group.peer_count().await
        );
    }

    /// Handles one inbound text frame from `conn_id`.
    pub async fn handle_frame(&self, conn_id: ConnId, raw: &str) {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += raw.len() as u64;
        }

        match SyncMessage::decode(raw) {
            Ok(msg) => self.dispatch(conn_id, msg).await,
            Err(ProtocolError::UnknownType(kind)) => {
                log::debug!("Ignoring unknown message type '{kind}' from conn_{conn_id}");
            }
            Err(e) => {
                log::warn!("Rejected frame from conn_{conn_id}: {e}");
                self.reject(conn_id, &format!("Invalid message format: {e}")).await;
            }
        }
    }

    /// Sends an error reply to one connection.
    pub async fn reject(&self, conn_id: ConnId, message: &str) {
        self.stats.write().await.rejected_frames += 1;
        self.reply(conn_id, SyncMessage::error(message));
    }

    async fn dispatch(&self, conn_id: ConnId, msg: SyncMessage) {
        if !msg.client_id.is_empty() {
            self.group.identify(conn_id, &msg.client_id).await;
        }

        match &msg.payload {
            Payload::SyncRequest { .. } => {
                let mirror = self.mirror.lock().await;
                log::debug!("Sync request from {}", msg.client_id);
                self.reply(conn_id, SyncMessage::from_server(Payload::SyncResponse(mirror.snapshot())));
            }
            Payload::Heartbeat => {
                self.reply(conn_id, SyncMessage::pong());
            }
            Payload::UserSync(UserSyncAction::RequestUsers { .. }) => {
                let mirror = self.mirror.lock().await;
                let users = mirror.users().to_vec();
                log::debug!("Answering user request from {} with {} users", msg.client_id, users.len());
                self.reply(
                    conn_id,
                    SyncMessage::from_server(Payload::UserSync(UserSyncAction::UsersResponse { users })),
                );
            }
            Payload::ClientConnected(_) => {
                log::info!("conn_{conn_id} registered as {}", msg.client_id);
            }
            _ if msg.message_type().is_mutation() => {
                let mut mirror = self.mirror.lock().await;
                mirror.apply(&msg);
                match self.group.broadcast(&msg, Some(conn_id)) {
                    Ok(_) => {
                        log::debug!("Relayed {} ({}) from {}", msg.message_type(), msg.payload.action(), msg.client_id);
                    }
                    Err(e) => log::error!("Failed to relay {}: {e}", msg.message_type()),
                }
                drop(mirror);
                self.stats.write().await.relayed_messages += 1;
            }
            _ => {
                log::debug!("Not relaying {} from conn_{conn_id}", msg.message_type());
            }
        }
    }

    fn reply(&self, conn_id: ConnId, msg: SyncMessage) {
        if let Err(e) = self.group.send_to(conn_id, &msg) {
            log::error!("Failed to encode {} reply: {e}", msg.message_type());
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.mirror.lock().await.snapshot()
    }

    pub async fn client_count(&self) -> usize {
        self.group.peer_count().await
    }

    pub async fn sync_log_len(&self) -> usize {
        self.mirror.lock().await.sync_log().len()
    }

    /// Body of the health endpoint.
    pub async fn health(&self) -> Value {
        json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "clientCount": self.client_count().await,
        })
    }

    /// Accounts for a connection that overran its broadcast buffer.
    /// The caller closes the socket; the terminal resyncs on reconnect.
    pub async fn drop_lagging(&self, conn_id: ConnId, missed: u64) {
        self.group.record_dropped(missed);
        self.stats.write().await.dropped_peers += 1;
        log::warn!("conn_{conn_id} fell {missed} frames behind, closing it");
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let bc = self.group.stats().await;
        stats.frames_dropped = bc.messages_dropped;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TableAction;
    use minipos_core::Table;

    fn drain(rx: &mut broadcast::Receiver<Arc<Frame>>, conn_id: ConnId) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if frame.is_for(conn_id) {
                out.push(SyncMessage::decode(&frame.text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_slow_peer_overrun_is_dropped() {
        let hub = RelayHub::new(&ServerConfig {
            broadcast_capacity: 2,
            ..ServerConfig::default()
        });
        let (fast, _rx_fast) = hub.connect(None).await;
        let (slow, mut rx_slow) = hub.connect(None).await;

        for i in 0..6 {
            let add = SyncMessage::new(
                Payload::UpdateTable(TableAction::Add(Table::new(i.to_string(), i, 4))),
                "client_fast",
            );
            hub.handle_frame(fast.conn_id, &add.encode().unwrap()).await;
        }

        let missed = match rx_slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => n,
            other => panic!("expected lag, got {other:?}"),
        };
        hub.drop_lagging(slow.conn_id, missed).await;

        let stats = hub.stats().await;
        assert_eq!(stats.dropped_peers, 1);
        assert_eq!(stats.frames_dropped, missed);
        // The mirror still holds every mutation for the resync.
        assert_eq!(hub.snapshot().await.tables.unwrap().len(), 6);
    }

    fn hub() -> RelayHub {
        RelayHub::new(&ServerConfig::default())
    }

    #[tokio::test]
    async fn test_connect_sends_ack() {
        let hub = hub();
        let (peer, mut rx) = hub.connect(None).await;
        let msgs = drain(&mut rx, peer.conn_id);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].payload {
            Payload::ClientConnected(n) => {
                assert_eq!(n.connection_id.as_deref(), Some(peer.connection_id().as_str()));
                assert_eq!(n.status.as_deref(), Some("connected"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_mutation_relayed_to_others_only() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        let (b, mut rx_b) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        drain(&mut rx_b, b.conn_id);

        let add = SyncMessage::new(Payload::UpdateTable(TableAction::Add(Table::new("5", 5, 4))), "client_a");
        hub.handle_frame(a.conn_id, &add.encode().unwrap()).await;

        assert!(drain(&mut rx_a, a.conn_id).is_empty());
        let got = drain(&mut rx_b, b.conn_id);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].client_id, "client_a");

        let snapshot = hub.snapshot().await;
        assert_eq!(snapshot.tables.unwrap()[0].id, "5");
        assert_eq!(hub.sync_log_len().await, 1);
    }

    #[tokio::test]
    async fn test_sync_request_answers_requester() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        let (b, mut rx_b) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        drain(&mut rx_b, b.conn_id);

        hub.handle_frame(a.conn_id, &SyncMessage::sync_request("client_a").encode().unwrap())
            .await;
        let got = drain(&mut rx_a, a.conn_id);
        assert!(matches!(got[0].payload, Payload::SyncResponse(_)));
        assert!(drain(&mut rx_b, b.conn_id).is_empty());
    }

    #[tokio::test]
    async fn test_request_users_is_point_to_point() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        let (b, mut rx_b) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        drain(&mut rx_b, b.conn_id);

        let req = SyncMessage::new(
            Payload::UserSync(UserSyncAction::RequestUsers {
                client_id: Some("client_a".into()),
            }),
            "client_a",
        );
        hub.handle_frame(a.conn_id, &req.encode().unwrap()).await;
        let got = drain(&mut rx_a, a.conn_id);
        assert!(matches!(
            got[0].payload,
            Payload::UserSync(UserSyncAction::UsersResponse { .. })
        ));
        assert!(drain(&mut rx_b, b.conn_id).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);

        hub.handle_frame(a.conn_id, "{{{ nope").await;
        let got = drain(&mut rx_a, a.conn_id);
        assert!(matches!(&got[0].payload, Payload::Error { message } if message.starts_with("Invalid message format")));
        assert_eq!(hub.stats().await.rejected_frames, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_ignored() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        hub.handle_frame(a.conn_id, r#"{"type":"SOMETHING_NEW","data":{}}"#).await;
        assert!(drain(&mut rx_a, a.conn_id).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_pong() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        hub.handle_frame(a.conn_id, &SyncMessage::heartbeat("client_a").encode().unwrap())
            .await;
        assert_eq!(drain(&mut rx_a, a.conn_id)[0].payload, Payload::Pong);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_others() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect(None).await;
        let (b, mut rx_b) = hub.connect(None).await;
        drain(&mut rx_a, a.conn_id);
        drain(&mut rx_b, b.conn_id);

        hub.handle_frame(a.conn_id, &SyncMessage::heartbeat("client_a").encode().unwrap())
            .await;
        hub.disconnect(a.conn_id).await;
        let got = drain(&mut rx_b, b.conn_id);
        assert!(matches!(
            &got[0].payload,
            Payload::ClientDisconnected(n) if n.client_id.as_deref() == Some("client_a")
        ));
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(hub.stats().await.active_connections, 1);
    }

    #[tokio::test]
    async fn test_health_body() {
        let hub = hub();
        let _ = hub.connect(None).await;
        let health = hub.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["clientCount"], 1);
        assert!(health["timestamp"].is_string());
    }
}
