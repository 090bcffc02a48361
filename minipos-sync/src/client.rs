//! Terminal side of the relay connection.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with exponential backoff, offline)
//! - Heartbeat keep-alive
//! - Outbound queue for frames sent while the socket is down
//! - Typed subscriptions for lifecycle events and incoming frames
//!
//! ```text
//! Idle ─► Connecting ─► Open ─► Closed ─► (backoff) ─► Connecting ─► ... ─► Offline
//! ```
//!
//! [`SyncChannel::send`] never blocks and never fails because of the network:
//! while the socket is down frames are queued and flushed in order on the
//! next open.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use minipos_core::{EventBus, Handler, SubscriptionId};

use crate::protocol::{ConnectionNotice, MessageType, Payload, ProtocolError, SyncMessage};

/// Port the relay listens on when the URL is derived from a host name.
pub const DEFAULT_RELAY_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `ws://host:port/path`
    pub url: String,
    /// First reconnect delay; doubled on every further attempt
    pub base_delay: Duration,
    /// Reconnect attempts before going offline
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Delay between open and the automatic `SYNC_REQUEST`
    pub sync_settle_delay: Duration,
    /// Frames kept while disconnected
    pub max_queued: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://localhost:{DEFAULT_RELAY_PORT}/ws"),
            base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            sync_settle_delay: Duration::from_millis(500),
            max_queued: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Relay on `host` at the well-known port and path.
    pub fn for_host(host: &str) -> Self {
        let host = match host {
            "localhost" | "127.0.0.1" | "" => "localhost",
            other => other,
        };
        Self::new(format!("ws://{host}:{DEFAULT_RELAY_PORT}/ws"))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// `connect` not called yet, or stopped by `disconnect`
    Idle,
    Connecting,
    Open,
    /// Socket lost; a reconnect may be scheduled
    Closed,
    /// Reconnect attempts exhausted; working from local state only
    Offline,
}

/// Subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    Connected,
    Disconnected,
    Offline,
    /// Frames of one type
    Message(MessageType),
    /// Every frame
    AnyMessage,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected { client_id: String },
    Disconnected,
    Offline,
    Message(SyncMessage),
}

/// What happened to a frame handed to [`SyncChannel::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    /// Queue full; the frame was discarded
    Dropped,
}

/// Reconnect delays: `base × 2^(n-1)` for attempt `n`, up to `max_attempts`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Frames waiting for an open socket.
///
/// Queued frames are replayed in order on reconnection.
#[derive(Debug)]
struct OutboundQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OutboundQueue {
    fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, String> {
        self.queue.drain(..)
    }

    /// Puts frames that were already handed to a socket back at the head.
    /// Returns how many did not fit.
    fn requeue_front(&mut self, frames: Vec<String>) -> usize {
        let room = self.max_size.saturating_sub(self.queue.len());
        let dropped = frames.len().saturating_sub(room);
        for text in frames.into_iter().take(room).rev() {
            self.queue.push_front(text);
        }
        dropped
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

struct Outbound {
    /// Writer of the live socket, if any
    sender: Option<mpsc::UnboundedSender<String>>,
    queue: OutboundQueue,
}

#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub state: ConnectionState,
    pub client_id: String,
    pub reconnect_attempts: u32,
    pub url: String,
    pub queued_messages: usize,
    pub sent_messages: u64,
    pub received_messages: u64,
}

struct Inner {
    client_id: String,
    config: ChannelConfig,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Outbound>,
    events: EventBus<ChannelEventKind, ChannelEvent>,
    attempts: AtomicU32,
    sent: AtomicU64,
    received: AtomicU64,
    /// Generation of the connection task allowed to run. Bumped by
    /// `connect` and `disconnect`; a task whose generation is stale stops
    /// and leaves state and outbound alone.
    generation: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// One logical relay connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<Inner>,
}

/// `client_{epoch ms}_{9 random base-36 chars}`
pub fn generate_client_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("client_{}_{}", crate::protocol::now_millis(), suffix)
}

impl SyncChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_client_id(config, generate_client_id())
    }

    pub fn with_client_id(config: ChannelConfig, client_id: impl Into<String>) -> Self {
        let (generation, _) = watch::channel(0);
        let max_queued = config.max_queued;
        Self {
            inner: Arc::new(Inner {
                client_id: client_id.into(),
                config,
                state: RwLock::new(ConnectionState::Idle),
                outbound: Mutex::new(Outbound {
                    sender: None,
                    queue: OutboundQueue::new(max_queued),
                }),
                events: EventBus::new(),
                attempts: AtomicU32::new(0),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                generation,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Starts the connection task. Must be called inside a tokio runtime.
    /// Does nothing if the task is already running.
    pub fn connect(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.attempts.store(0, Ordering::Relaxed);
        let generation = self.inner.advance_generation(ConnectionState::Connecting);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run(generation).await }));
    }

    /// Closes the socket and cancels any pending reconnect. Queued frames
    /// are kept for a later `connect`.
    pub fn disconnect(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.take().is_some_and(|t| !t.is_finished()) {
            log::debug!("Stopping connection task for {}", self.inner.client_id);
        }
        let was_open = self.is_open();
        self.inner.advance_generation(ConnectionState::Idle);
        self.inner.lock_outbound().sender = None;
        drop(task);

        if was_open {
            self.inner
                .events
                .publish(&ChannelEventKind::Disconnected, &ChannelEvent::Disconnected);
        }
        log::info!("Sync channel {} disconnected", self.inner.client_id);
    }

    /// Sends a payload stamped with this channel's client id.
    pub fn send(&self, payload: Payload) -> Result<Delivery, ProtocolError> {
        self.send_message(&SyncMessage::new(payload, self.inner.client_id.clone()))
    }

    pub fn send_message(&self, msg: &SyncMessage) -> Result<Delivery, ProtocolError> {
        let text = msg.encode()?;
        let delivery = self.inner.push(text);
        match delivery {
            Delivery::Sent => log::debug!("Sent {} ({})", msg.message_type(), msg.payload.action()),
            Delivery::Queued => log::debug!("Queued {} while not connected", msg.message_type()),
            Delivery::Dropped => log::warn!("Outbound queue full, dropped {}", msg.message_type()),
        }
        Ok(delivery)
    }

    pub fn request_sync(&self) -> Result<Delivery, ProtocolError> {
        self.send_message(&SyncMessage::sync_request(&self.inner.client_id))
    }

    pub fn subscribe(&self, kind: ChannelEventKind, handler: Handler<ChannelEvent>) -> SubscriptionId {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Decodes one incoming frame and hands it to subscribers. Frames that
    /// carry this channel's own client id are dropped. Returns whether the
    /// frame was dispatched.
    pub fn dispatch_incoming(&self, raw: &str) -> bool {
        self.inner.dispatch_incoming(raw)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock_outbound().queue.len()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            state: self.state(),
            client_id: self.inner.client_id.clone(),
            reconnect_attempts: self.inner.attempts.load(Ordering::Relaxed),
            url: self.inner.config.url.clone(),
            queued_messages: self.queued_len(),
            sent_messages: self.inner.sent.load(Ordering::Relaxed),
            received_messages: self.inner.received.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    /// Retires every running task and sets `state`, under the state lock so
    /// a retiring task cannot overwrite it.
    fn advance_generation(&self, state: ConnectionState) -> u64 {
        let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
        let next = *self.generation.borrow() + 1;
        self.generation.send_replace(next);
        *current = state;
        next
    }

    /// Sets the state on behalf of task `generation`; ignored once stale.
    fn set_state_for(&self, generation: u64, state: ConnectionState) -> bool {
        let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !self.is_current(generation) {
            return false;
        }
        *current = state;
        true
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, text: String) -> Delivery {
        let mut out = self.lock_outbound();
        if let Some(tx) = &out.sender {
            match tx.send(text) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    return Delivery::Sent;
                }
                Err(mpsc::error::SendError(text)) => {
                    out.sender = None;
                    return if out.queue.enqueue(text) { Delivery::Queued } else { Delivery::Dropped };
                }
            }
        }
        if out.queue.enqueue(text) {
            Delivery::Queued
        } else {
            Delivery::Dropped
        }
    }

    /// Installs the socket writer, flushing queued frames ahead of anything
    /// sent afterwards. Refused for a stale task.
    fn open_outbound(&self, generation: u64, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut out = self.lock_outbound();
        if !self.is_current(generation) {
            return false;
        }
        let queued: Vec<String> = out.queue.drain().collect();
        if !queued.is_empty() {
            log::info!("Replaying {} queued frames", queued.len());
        }
        for text in queued {
            if tx.send(text).is_ok() {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        out.sender = Some(tx);
        true
    }

    /// Detaches the socket writer of task `generation`. Frames it never
    /// wrote, `unsent` first, move to a newer socket if one is open or back
    /// to the head of the queue otherwise.
    fn close_outbound(&self, generation: u64, unsent: Option<String>, rx: &mut mpsc::UnboundedReceiver<String>) {
        let mut out = self.lock_outbound();
        if self.is_current(generation) {
            out.sender = None;
        }
        rx.close();
        let leftover: Vec<String> = unsent.into_iter().chain(std::iter::from_fn(|| rx.try_recv().ok())).collect();
        if leftover.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        match &out.sender {
            Some(tx) => {
                log::debug!("Moving {} unsent frames to the new socket", leftover.len());
                for text in leftover {
                    if let Err(mpsc::error::SendError(text)) = tx.send(text) {
                        requeue.push(text);
                    }
                }
            }
            None => requeue = leftover,
        }
        if requeue.is_empty() {
            return;
        }
        let count = requeue.len();
        let dropped = out.queue.requeue_front(requeue);
        log::debug!("Requeued {} unsent frames", count - dropped);
        if dropped > 0 {
            log::warn!("Outbound queue full, dropped {dropped} unsent frames");
        }
    }

    fn dispatch_incoming(&self, raw: &str) -> bool {
        let msg = match SyncMessage::decode(raw) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(kind)) => {
                log::debug!("Ignoring unknown message type '{kind}'");
                return false;
            }
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return false;
            }
        };
        if msg.is_from(&self.client_id) {
            log::trace!("Dropping echo of own {}", msg.message_type());
            return false;
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        log::debug!("Received {} from {}", msg.message_type(), msg.client_id);

        let kind = ChannelEventKind::Message(msg.message_type());
        let event = ChannelEvent::Message(msg);
        self.events.publish(&kind, &event);
        self.events.publish(&ChannelEventKind::AnyMessage, &event);
        true
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut shutdown = self.generation.subscribe();
        let mut backoff = Backoff::new(self.config.base_delay, self.config.max_reconnect_attempts);

        loop {
            if !self.set_state_for(generation, ConnectionState::Connecting) {
                break;
            }
            log::debug!("Connecting to {}", self.config.url);

            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    backoff.reset();
                    self.attempts.store(0, Ordering::Relaxed);
                    self.session(generation, ws, &mut shutdown).await;
                    if self.set_state_for(generation, ConnectionState::Closed) {
                        self.events.publish(&ChannelEventKind::Disconnected, &ChannelEvent::Disconnected);
                    }
                }
                Err(e) => {
                    log::warn!("Failed to connect to {}: {e}", self.config.url);
                    self.set_state_for(generation, ConnectionState::Closed);
                }
            }

            if !self.is_current(generation) {
                break;
            }
            match backoff.next_delay() {
                Some(delay) => {
                    self.attempts.store(backoff.attempts(), Ordering::Relaxed);
                    log::info!(
                        "Reconnecting ({}/{}) in {:?}",
                        backoff.attempts(),
                        self.config.max_reconnect_attempts,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    if self.set_state_for(generation, ConnectionState::Offline) {
                        log::warn!("Max reconnection attempts reached, working offline");
                        self.events.publish(&ChannelEventKind::Offline, &ChannelEvent::Offline);
                    }
                    return;
                }
            }
        }
        log::debug!("Connection task {generation} for {} stopped", self.client_id);
    }

    /// Drives one open socket until it closes or shutdown is requested.
    async fn session<S>(&self, generation: u64, ws: S, shutdown: &mut watch::Receiver<u64>)
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let hello = SyncMessage::new(
            Payload::ClientConnected(ConnectionNotice {
                client_id: Some(self.client_id.clone()),
                user_agent: Some(format!("minipos-sync/{}", env!("CARGO_PKG_VERSION"))),
                ..Default::default()
            }),
            self.client_id.clone(),
        );
        match hello.encode() {
            Ok(text) => {
                if tx.send(text).is_err() {
                    log::debug!("Registration not queued, socket writer already closed");
                }
            }
            Err(e) => log::error!("Failed to encode registration: {e}"),
        }
        if !self.open_outbound(generation, tx) || !self.set_state_for(generation, ConnectionState::Open) {
            log::debug!("Connection task {generation} retired before open, closing socket");
            if let Err(e) = sink.send(Message::Close(None)).await {
                log::debug!("Close frame not sent: {e}");
            }
            self.close_outbound(generation, None, &mut rx);
            return;
        }
        log::info!("Connected to {} as {}", self.config.url, self.client_id);
        self.events.publish(
            &ChannelEventKind::Connected,
            &ChannelEvent::Connected {
                client_id: self.client_id.clone(),
            },
        );

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let settle = tokio::time::sleep(self.config.sync_settle_delay);
        tokio::pin!(settle);
        let mut synced = false;
        let mut unsent = None;

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::text(text.clone())).await {
                            log::warn!("Send failed: {e}");
                            unsent = Some(text);
                            break;
                        }
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.dispatch_incoming(text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Relay closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("Connection error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    if let Ok(text) = SyncMessage::heartbeat(&self.client_id).encode() {
                        self.push(text);
                    }
                }
                _ = &mut settle, if !synced => {
                    synced = true;
                    if let Ok(text) = SyncMessage::sync_request(&self.client_id).encode() {
                        self.push(text);
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        log::debug!("Close frame not sent: {e}");
                    }
                    break;
                }
            }
        }

        self.close_outbound(generation, unsent, &mut rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TableAction;
    use minipos_core::Table;

    fn channel() -> SyncChannel {
        SyncChannel::with_client_id(ChannelConfig::new("ws://127.0.0.1:1/ws"), "client_self")
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![100, 200, 400, 800, 1600]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
        assert_eq!(backoff.attempts(), 5);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_fourth_retry_waits_eight_base_delays() {
        let base = Duration::from_secs(1);
        let mut backoff = Backoff::new(base, 5);
        for _ in 0..3 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay().unwrap() >= base * 8);
    }

    #[test]
    fn test_config_for_host() {
        assert_eq!(ChannelConfig::for_host("127.0.0.1").url, "ws://localhost:8080/ws");
        assert_eq!(ChannelConfig::for_host("pos-1.lan").url, "ws://pos-1.lan:8080/ws");
        let config = ChannelConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_client_id_format() {
        let id = generate_client_id();
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "client");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(generate_client_id(), id);
    }

    #[test]
    fn test_send_while_idle_queues_in_order() {
        let ch = channel();
        assert_eq!(ch.state(), ConnectionState::Idle);
        for n in 1..=3 {
            let delivery = ch
                .send(Payload::UpdateTable(TableAction::Add(Table::new(n.to_string(), n, 4))))
                .unwrap();
            assert_eq!(delivery, Delivery::Queued);
        }
        assert_eq!(ch.queued_len(), 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(ch.inner.open_outbound(0, tx));
        assert_eq!(ch.queued_len(), 0);
        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| match SyncMessage::decode(&t).unwrap().payload {
                Payload::UpdateTable(TableAction::Add(t)) => t.id,
                other => panic!("unexpected payload: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(ch.send(Payload::Heartbeat).unwrap(), Delivery::Sent);
    }

    #[test]
    fn test_close_requeues_unsent() {
        let ch = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.inner.open_outbound(0, tx);
        ch.send(Payload::Heartbeat).unwrap();
        ch.inner.close_outbound(0, Some("first".to_string()), &mut rx);
        assert_eq!(ch.queued_len(), 2);
        assert_eq!(ch.send(Payload::Heartbeat).unwrap(), Delivery::Queued);
    }

    #[test]
    fn test_retired_session_leaves_newer_socket_alone() {
        let ch = channel();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        assert!(ch.inner.open_outbound(0, old_tx));
        ch.send(Payload::Heartbeat).unwrap();

        let newer = ch.inner.advance_generation(ConnectionState::Connecting);
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        assert!(!ch.inner.open_outbound(0, mpsc::unbounded_channel().0));
        assert!(ch.inner.open_outbound(newer, new_tx));
        assert!(ch.inner.set_state_for(newer, ConnectionState::Open));

        // The retired session winds down after the newer one opened.
        ch.inner.close_outbound(0, None, &mut old_rx);
        assert!(!ch.inner.set_state_for(0, ConnectionState::Closed));
        assert_eq!(ch.state(), ConnectionState::Open);
        assert!(new_rx.try_recv().is_ok(), "unsent frame moves to the newer socket");
        assert_eq!(ch.send(Payload::Heartbeat).unwrap(), Delivery::Sent);
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn test_requeued_frames_go_first() {
        let ch = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.inner.open_outbound(0, tx);
        ch.send(Payload::Heartbeat).unwrap();
        ch.disconnect();
        ch.send(Payload::Pong).unwrap();

        let stale = 0;
        ch.inner.close_outbound(stale, None, &mut rx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let current = *ch.inner.generation.borrow();
        ch.inner.open_outbound(current, tx);
        let types: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| SyncMessage::decode(&t).unwrap().message_type())
            .collect();
        assert_eq!(types, vec![MessageType::Heartbeat, MessageType::Pong]);
    }

    #[test]
    fn test_queue_limit() {
        let mut config = ChannelConfig::new("ws://127.0.0.1:1/ws");
        config.max_queued = 1;
        let ch = SyncChannel::with_client_id(config, "client_self");
        assert_eq!(ch.send(Payload::Heartbeat).unwrap(), Delivery::Queued);
        assert_eq!(ch.send(Payload::Heartbeat).unwrap(), Delivery::Dropped);
    }

    #[test]
    fn test_self_echo_is_not_dispatched() {
        let ch = channel();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        ch.subscribe(
            ChannelEventKind::AnyMessage,
            Arc::new(move |_: &ChannelEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let own = SyncMessage::new(Payload::Heartbeat, "client_self").encode().unwrap();
        assert!(!ch.dispatch_incoming(&own));
        let other = SyncMessage::new(Payload::Heartbeat, "client_other").encode().unwrap();
        assert!(ch.dispatch_incoming(&other));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ch.stats().received_messages, 1);
    }

    #[test]
    fn test_typed_subscription_and_unsubscribe() {
        let ch = channel();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let id = ch.subscribe(
            ChannelEventKind::Message(MessageType::UpdateTable),
            Arc::new(move |_: &ChannelEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let table = SyncMessage::new(
            Payload::UpdateTable(TableAction::Add(Table::new("1", 1, 2))),
            "client_other",
        )
        .encode()
        .unwrap();
        let beat = SyncMessage::heartbeat("client_other").encode().unwrap();
        ch.dispatch_incoming(&table);
        ch.dispatch_incoming(&beat);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(ch.unsubscribe(id));
        ch.dispatch_incoming(&table);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let ch = channel();
        assert!(!ch.dispatch_incoming("not json"));
        assert!(!ch.dispatch_incoming(r#"{"type":"FUTURE_THING","data":{}}"#));
    }

    #[tokio::test]
    async fn test_goes_offline_after_max_attempts() {
        let mut config = ChannelConfig::new("ws://127.0.0.1:9/ws");
        config.base_delay = Duration::from_millis(1);
        config.max_reconnect_attempts = 2;
        let ch = SyncChannel::with_client_id(config, "client_self");

        let offline = Arc::new(AtomicU32::new(0));
        let flag = offline.clone();
        ch.subscribe(
            ChannelEventKind::Offline,
            Arc::new(move |_: &ChannelEvent| {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );
        ch.connect();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ch.state() != ConnectionState::Offline && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ch.state(), ConnectionState::Offline);
        assert_eq!(offline.load(Ordering::SeqCst), 1);
        assert_eq!(ch.stats().reconnect_attempts, 2);
    }
}
