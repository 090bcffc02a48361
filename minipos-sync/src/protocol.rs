//! JSON text-frame protocol shared by terminals and the relay.
//!
//! Every frame is one JSON object:
//! ```text
//! { "type": "UPDATE_TABLE", "data": { ... }, "timestamp": 1736930000000, "clientId": "client_..." }
//! ```
//!
//! `data` is decoded into a typed [`Payload`] per message type, and mutation
//! payloads into a typed action per collection (`{ "action": "add", "data": ... }`).
//! An action the decoder does not know is a protocol error; a message type
//! it does not know is reported as [`ProtocolError::UnknownType`] so callers
//! can ignore it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use minipos_core::{
    ActiveSession, CategoryRef, EntityRef, MenuItem, OrderHistoryEntry, Settings, Table, User,
};

/// `clientId` the relay stamps on frames it originates.
pub const SERVER_ID: &str = "server";

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client asks for the full mirror
    SyncRequest,
    /// Full mirror snapshot
    SyncResponse,
    UpdateTable,
    UpdateOrder,
    UpdateMenu,
    UpdateSettings,
    UpdateUsers,
    /// User list pull / push
    UserSync,
    SessionUpdate,
    SessionSync,
    UserLogin,
    UserLogout,
    /// Gossip request: every other terminal re-broadcasts its sessions
    RefreshSessions,
    TerminateSession,
    ForceLogout,
    /// Connection acknowledgement (relay) or registration (client)
    ClientConnected,
    ClientDisconnected,
    /// Heartbeat ping
    Heartbeat,
    /// Heartbeat reply
    Pong,
    /// Per-message error reply
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        MessageType::SyncRequest,
        MessageType::SyncResponse,
        MessageType::UpdateTable,
        MessageType::UpdateOrder,
        MessageType::UpdateMenu,
        MessageType::UpdateSettings,
        MessageType::UpdateUsers,
        MessageType::UserSync,
        MessageType::SessionUpdate,
        MessageType::SessionSync,
        MessageType::UserLogin,
        MessageType::UserLogout,
        MessageType::RefreshSessions,
        MessageType::TerminateSession,
        MessageType::ForceLogout,
        MessageType::ClientConnected,
        MessageType::ClientDisconnected,
        MessageType::Heartbeat,
        MessageType::Pong,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SyncRequest => "SYNC_REQUEST",
            MessageType::SyncResponse => "SYNC_RESPONSE",
            MessageType::UpdateTable => "UPDATE_TABLE",
            MessageType::UpdateOrder => "UPDATE_ORDER",
            MessageType::UpdateMenu => "UPDATE_MENU",
            MessageType::UpdateSettings => "UPDATE_SETTINGS",
            MessageType::UpdateUsers => "UPDATE_USERS",
            MessageType::UserSync => "USER_SYNC",
            MessageType::SessionUpdate => "SESSION_UPDATE",
            MessageType::SessionSync => "SESSION_SYNC",
            MessageType::UserLogin => "USER_LOGIN",
            MessageType::UserLogout => "USER_LOGOUT",
            MessageType::RefreshSessions => "REFRESH_SESSIONS",
            MessageType::TerminateSession => "TERMINATE_SESSION",
            MessageType::ForceLogout => "FORCE_LOGOUT",
            MessageType::ClientConnected => "CLIENT_CONNECTED",
            MessageType::ClientDisconnected => "CLIENT_DISCONNECTED",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
        }
    }

    /// Parses a wire name. Also accepts the names older relays used for the
    /// welcome frame and error replies.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "connection" => return Some(MessageType::ClientConnected),
            "SYNC_ERROR" | "UPDATE_ERROR" => return Some(MessageType::Error),
            _ => {}
        }
        Self::ALL.iter().copied().find(|t| t.as_str() == raw)
    }

    /// Types the relay folds into its mirror and rebroadcasts.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            MessageType::UpdateTable
                | MessageType::UpdateOrder
                | MessageType::UpdateMenu
                | MessageType::UpdateSettings
                | MessageType::UpdateUsers
                | MessageType::UserSync
                | MessageType::SessionUpdate
                | MessageType::SessionSync
                | MessageType::UserLogin
                | MessageType::UserLogout
                | MessageType::RefreshSessions
                | MessageType::TerminateSession
                | MessageType::ForceLogout
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Unknown action '{action}' for {kind}")]
    UnknownAction { kind: MessageType, action: String },

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Full mirror contents. A `None` collection was absent from the frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub tables: Option<Vec<Table>>,
    #[serde(default)]
    pub menu_items: Option<Vec<MenuItem>>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub order_history: Option<Vec<OrderHistoryEntry>>,
    #[serde(default)]
    pub active_sessions: Option<Vec<ActiveSession>>,
    #[serde(default)]
    pub users: Option<Vec<User>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableAction {
    Add(Table),
    Update(Table),
    Delete(EntityRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    Add(OrderHistoryEntry),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MenuAction {
    AddItem(MenuItem),
    UpdateItem(MenuItem),
    DeleteItem(EntityRef),
    AddCategory(CategoryRef),
    DeleteCategory(CategoryRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    Add(User),
    Update(User),
    Delete(EntityRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserSyncAction {
    /// Point-to-point pull; the relay answers only the requester.
    RequestUsers { client_id: Option<String> },
    UsersResponse { users: Vec<User> },
    /// Full user list pushed by a terminal. Wire names `broadcast_users`
    /// and `users_broadcast` are both accepted.
    BroadcastUsers { users: Vec<User>, from_client: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBatchKind {
    /// `session_list_updated`
    ListUpdated,
    /// `broadcast_sessions`
    Broadcast,
}

impl SessionBatchKind {
    fn as_str(&self) -> &'static str {
        match self {
            SessionBatchKind::ListUpdated => "session_list_updated",
            SessionBatchKind::Broadcast => "broadcast_sessions",
        }
    }
}

/// A set of sessions one terminal speaks for.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBatch {
    pub kind: SessionBatchKind,
    pub sessions: Vec<ActiveSession>,
    pub from_client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutNotice {
    pub client_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_role: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Termination {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForcedLogout {
    pub target_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Connection lifecycle notice. Sent by a terminal to register itself and
/// by the relay to acknowledge a new socket.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Typed `data` of a frame, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    SyncRequest { client_id: Option<String> },
    SyncResponse(Snapshot),
    UpdateTable(TableAction),
    UpdateOrder(OrderAction),
    UpdateMenu(MenuAction),
    UpdateSettings(Settings),
    UpdateUsers(UserAction),
    UserSync(UserSyncAction),
    SessionUpdate(SessionBatch),
    SessionSync(SessionBatch),
    UserLogin(ActiveSession),
    UserLogout(LogoutNotice),
    RefreshSessions(RefreshRequest),
    TerminateSession(Termination),
    ForceLogout(ForcedLogout),
    ClientConnected(ConnectionNotice),
    ClientDisconnected(ConnectionNotice),
    Heartbeat,
    Pong,
    Error { message: String },
}

/// `{ action, data?, sessions?, users?, fromClient?, clientId? }`
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionEnvelope {
    #[serde(default)]
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sessions: Option<Vec<ActiveSession>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    users: Option<Vec<User>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from_client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

impl ActionEnvelope {
    fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Default::default()
        }
    }

    fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self, ProtocolError> {
        self.data = Some(serde_json::to_value(data).map_err(ProtocolError::Encode)?);
        Ok(self)
    }

    fn parse(kind: MessageType, data: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(data).map_err(|e| invalid(kind, e))
    }

    fn take_data<T: DeserializeOwned>(&mut self, kind: MessageType) -> Result<T, ProtocolError> {
        let data = self.data.take().ok_or_else(|| ProtocolError::InvalidPayload {
            kind,
            reason: format!("action '{}' requires data", self.action),
        })?;
        serde_json::from_value(data).map_err(|e| invalid(kind, e))
    }

    fn into_value(self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(ProtocolError::Encode)
    }
}

fn unknown_action(kind: MessageType, action: &str) -> ProtocolError {
    ProtocolError::UnknownAction {
        kind,
        action: action.to_string(),
    }
}

fn invalid(kind: MessageType, e: impl fmt::Display) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    }
}

impl TableAction {
    const KIND: MessageType = MessageType::UpdateTable;

    fn to_envelope(&self) -> Result<ActionEnvelope, ProtocolError> {
        match self {
            TableAction::Add(t) => ActionEnvelope::new("add").with_data(t),
            TableAction::Update(t) => ActionEnvelope::new("update").with_data(t),
            TableAction::Delete(r) => ActionEnvelope::new("delete").with_data(r),
        }
    }

    fn from_envelope(mut env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let action = env.action.clone();
        match action.as_str() {
            "add" => Ok(TableAction::Add(env.take_data(Self::KIND)?)),
            "update" => Ok(TableAction::Update(env.take_data(Self::KIND)?)),
            "delete" => Ok(TableAction::Delete(env.take_data(Self::KIND)?)),
            _ => Err(unknown_action(Self::KIND, &action)),
        }
    }
}

impl OrderAction {
    const KIND: MessageType = MessageType::UpdateOrder;

    fn to_envelope(&self) -> Result<ActionEnvelope, ProtocolError> {
        match self {
            OrderAction::Add(o) => ActionEnvelope::new("add").with_data(o),
            OrderAction::Clear => ActionEnvelope::new("clear").with_data(&json!({})),
        }
    }

    fn from_envelope(mut env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let action = env.action.clone();
        match action.as_str() {
            "add" => Ok(OrderAction::Add(env.take_data(Self::KIND)?)),
            "clear" => Ok(OrderAction::Clear),
            _ => Err(unknown_action(Self::KIND, &action)),
        }
    }
}

impl MenuAction {
    const KIND: MessageType = MessageType::UpdateMenu;

    fn to_envelope(&self) -> Result<ActionEnvelope, ProtocolError> {
        match self {
            MenuAction::AddItem(m) => ActionEnvelope::new("add_item").with_data(m),
            MenuAction::UpdateItem(m) => ActionEnvelope::new("update_item").with_data(m),
            MenuAction::DeleteItem(r) => ActionEnvelope::new("delete_item").with_data(r),
            MenuAction::AddCategory(c) => ActionEnvelope::new("add_category").with_data(c),
            MenuAction::DeleteCategory(c) => ActionEnvelope::new("delete_category").with_data(c),
        }
    }

    fn from_envelope(mut env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let action = env.action.clone();
        match action.as_str() {
            "add_item" => Ok(MenuAction::AddItem(env.take_data(Self::KIND)?)),
            "update_item" => Ok(MenuAction::UpdateItem(env.take_data(Self::KIND)?)),
            "delete_item" => Ok(MenuAction::DeleteItem(env.take_data(Self::KIND)?)),
            "add_category" => Ok(MenuAction::AddCategory(env.take_data(Self::KIND)?)),
            "delete_category" => Ok(MenuAction::DeleteCategory(env.take_data(Self::KIND)?)),
            _ => Err(unknown_action(Self::KIND, &action)),
        }
    }
}

impl UserAction {
    const KIND: MessageType = MessageType::UpdateUsers;

    fn to_envelope(&self) -> Result<ActionEnvelope, ProtocolError> {
        match self {
            UserAction::Add(u) => ActionEnvelope::new("add").with_data(u),
            UserAction::Update(u) => ActionEnvelope::new("update").with_data(u),
            UserAction::Delete(r) => ActionEnvelope::new("delete").with_data(r),
        }
    }

    fn from_envelope(mut env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let action = env.action.clone();
        match action.as_str() {
            "add" => Ok(UserAction::Add(env.take_data(Self::KIND)?)),
            "update" => Ok(UserAction::Update(env.take_data(Self::KIND)?)),
            "delete" => Ok(UserAction::Delete(env.take_data(Self::KIND)?)),
            _ => Err(unknown_action(Self::KIND, &action)),
        }
    }
}

impl UserSyncAction {
    const KIND: MessageType = MessageType::UserSync;

    fn to_envelope(&self) -> ActionEnvelope {
        match self {
            UserSyncAction::RequestUsers { client_id } => ActionEnvelope {
                client_id: client_id.clone(),
                ..ActionEnvelope::new("request_users")
            },
            UserSyncAction::UsersResponse { users } => ActionEnvelope {
                users: Some(users.clone()),
                ..ActionEnvelope::new("users_response")
            },
            UserSyncAction::BroadcastUsers { users, from_client } => ActionEnvelope {
                users: Some(users.clone()),
                from_client: from_client.clone(),
                ..ActionEnvelope::new("broadcast_users")
            },
        }
    }

    fn from_envelope(env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let action = env.action.clone();
        match action.as_str() {
            "request_users" => Ok(UserSyncAction::RequestUsers {
                client_id: env.client_id,
            }),
            "users_response" => Ok(UserSyncAction::UsersResponse {
                users: env.users.unwrap_or_default(),
            }),
            "broadcast_users" | "users_broadcast" => Ok(UserSyncAction::BroadcastUsers {
                users: env.users.unwrap_or_default(),
                from_client: env.from_client,
            }),
            _ => Err(unknown_action(Self::KIND, &action)),
        }
    }
}

impl SessionBatch {
    pub fn new(kind: SessionBatchKind, sessions: Vec<ActiveSession>, from_client: Option<String>) -> Self {
        Self {
            kind,
            sessions,
            from_client,
        }
    }

    fn to_envelope(&self) -> ActionEnvelope {
        ActionEnvelope {
            sessions: Some(self.sessions.clone()),
            from_client: self.from_client.clone(),
            ..ActionEnvelope::new(self.kind.as_str())
        }
    }

    fn from_envelope(kind: MessageType, env: ActionEnvelope) -> Result<Self, ProtocolError> {
        let batch_kind = match env.action.as_str() {
            "session_list_updated" => SessionBatchKind::ListUpdated,
            "broadcast_sessions" => SessionBatchKind::Broadcast,
            other => return Err(unknown_action(kind, other)),
        };
        Ok(Self {
            kind: batch_kind,
            sessions: env.sessions.unwrap_or_default(),
            from_client: env.from_client,
        })
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(kind: MessageType, data: Value) -> Result<T, ProtocolError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|e| invalid(kind, e))
}

fn decode_required<T: DeserializeOwned>(kind: MessageType, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| invalid(kind, e))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(ProtocolError::Encode)
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::SyncRequest { .. } => MessageType::SyncRequest,
            Payload::SyncResponse(_) => MessageType::SyncResponse,
            Payload::UpdateTable(_) => MessageType::UpdateTable,
            Payload::UpdateOrder(_) => MessageType::UpdateOrder,
            Payload::UpdateMenu(_) => MessageType::UpdateMenu,
            Payload::UpdateSettings(_) => MessageType::UpdateSettings,
            Payload::UpdateUsers(_) => MessageType::UpdateUsers,
            Payload::UserSync(_) => MessageType::UserSync,
            Payload::SessionUpdate(_) => MessageType::SessionUpdate,
            Payload::SessionSync(_) => MessageType::SessionSync,
            Payload::UserLogin(_) => MessageType::UserLogin,
            Payload::UserLogout(_) => MessageType::UserLogout,
            Payload::RefreshSessions(_) => MessageType::RefreshSessions,
            Payload::TerminateSession(_) => MessageType::TerminateSession,
            Payload::ForceLogout(_) => MessageType::ForceLogout,
            Payload::ClientConnected(_) => MessageType::ClientConnected,
            Payload::ClientDisconnected(_) => MessageType::ClientDisconnected,
            Payload::Heartbeat => MessageType::Heartbeat,
            Payload::Pong => MessageType::Pong,
            Payload::Error { .. } => MessageType::Error,
        }
    }

    /// Short action label, used by the relay's sync log.
    pub fn action(&self) -> &'static str {
        match self {
            Payload::UpdateTable(TableAction::Add(_)) | Payload::UpdateUsers(UserAction::Add(_)) => "add",
            Payload::UpdateTable(TableAction::Update(_)) | Payload::UpdateUsers(UserAction::Update(_)) => "update",
            Payload::UpdateTable(TableAction::Delete(_)) | Payload::UpdateUsers(UserAction::Delete(_)) => "delete",
            Payload::UpdateOrder(OrderAction::Add(_)) => "add",
            Payload::UpdateOrder(OrderAction::Clear) => "clear",
            Payload::UpdateMenu(MenuAction::AddItem(_)) => "add_item",
            Payload::UpdateMenu(MenuAction::UpdateItem(_)) => "update_item",
            Payload::UpdateMenu(MenuAction::DeleteItem(_)) => "delete_item",
            Payload::UpdateMenu(MenuAction::AddCategory(_)) => "add_category",
            Payload::UpdateMenu(MenuAction::DeleteCategory(_)) => "delete_category",
            Payload::UserSync(UserSyncAction::RequestUsers { .. }) => "request_users",
            Payload::UserSync(UserSyncAction::UsersResponse { .. }) => "users_response",
            Payload::UserSync(UserSyncAction::BroadcastUsers { .. }) => "broadcast_users",
            Payload::SessionUpdate(b) | Payload::SessionSync(b) => b.kind.as_str(),
            _ => "update",
        }
    }

    pub(crate) fn to_data(&self) -> Result<Value, ProtocolError> {
        match self {
            Payload::SyncRequest { client_id } => Ok(match client_id {
                Some(id) => json!({ "clientId": id }),
                None => json!({}),
            }),
            Payload::SyncResponse(snapshot) => to_value(snapshot),
            Payload::UpdateTable(a) => a.to_envelope()?.into_value(),
            Payload::UpdateOrder(a) => a.to_envelope()?.into_value(),
            Payload::UpdateMenu(a) => a.to_envelope()?.into_value(),
            Payload::UpdateSettings(s) => to_value(s),
            Payload::UpdateUsers(a) => a.to_envelope()?.into_value(),
            Payload::UserSync(a) => a.to_envelope().into_value(),
            Payload::SessionUpdate(b) | Payload::SessionSync(b) => b.to_envelope().into_value(),
            Payload::UserLogin(s) => to_value(s),
            Payload::UserLogout(n) => to_value(n),
            Payload::RefreshSessions(r) => to_value(r),
            Payload::TerminateSession(t) => to_value(t),
            Payload::ForceLogout(f) => to_value(f),
            Payload::ClientConnected(n) | Payload::ClientDisconnected(n) => to_value(n),
            Payload::Heartbeat => Ok(json!({})),
            Payload::Pong => Ok(Value::Null),
            Payload::Error { message } => Ok(json!({ "message": message })),
        }
    }

    fn from_data(kind: MessageType, data: Value, message: Option<String>) -> Result<Self, ProtocolError> {
        let payload = match kind {
            MessageType::SyncRequest => Payload::SyncRequest {
                client_id: data.get("clientId").and_then(Value::as_str).map(str::to_string),
            },
            MessageType::SyncResponse => Payload::SyncResponse(decode_or_default(kind, data)?),
            MessageType::UpdateTable => {
                Payload::UpdateTable(TableAction::from_envelope(ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::UpdateOrder => {
                Payload::UpdateOrder(OrderAction::from_envelope(ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::UpdateMenu => {
                Payload::UpdateMenu(MenuAction::from_envelope(ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::UpdateSettings => Payload::UpdateSettings(
                Settings::from_value(data).ok_or_else(|| invalid(kind, "settings must be an object"))?,
            ),
            MessageType::UpdateUsers => {
                Payload::UpdateUsers(UserAction::from_envelope(ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::UserSync => {
                Payload::UserSync(UserSyncAction::from_envelope(ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::SessionUpdate => {
                Payload::SessionUpdate(SessionBatch::from_envelope(kind, ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::SessionSync => {
                Payload::SessionSync(SessionBatch::from_envelope(kind, ActionEnvelope::parse(kind, data)?)?)
            }
            MessageType::UserLogin => Payload::UserLogin(decode_required(kind, data)?),
            MessageType::UserLogout => Payload::UserLogout(decode_required(kind, data)?),
            MessageType::RefreshSessions => Payload::RefreshSessions(decode_or_default(kind, data)?),
            MessageType::TerminateSession => Payload::TerminateSession(decode_required(kind, data)?),
            MessageType::ForceLogout => Payload::ForceLogout(decode_required(kind, data)?),
            MessageType::ClientConnected => Payload::ClientConnected(decode_or_default(kind, data)?),
            MessageType::ClientDisconnected => Payload::ClientDisconnected(decode_or_default(kind, data)?),
            MessageType::Heartbeat => Payload::Heartbeat,
            MessageType::Pong => Payload::Pong,
            MessageType::Error => Payload::Error {
                message: message
                    .or_else(|| data.get("message").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default(),
            },
        };
        Ok(payload)
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Value,
    #[serde(default, rename = "clientId")]
    client_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub payload: Payload,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub client_id: String,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Accepts epoch milliseconds or an RFC 3339 string. Anything else is 0.
fn parse_timestamp(raw: &Value) -> i64 {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .or_else(|_| s.parse::<i64>())
            .unwrap_or(0),
        _ => 0,
    }
}

impl SyncMessage {
    pub fn new(payload: Payload, client_id: impl Into<String>) -> Self {
        Self {
            payload,
            timestamp: now_millis(),
            client_id: client_id.into(),
        }
    }

    /// A frame originated by the relay.
    pub fn from_server(payload: Payload) -> Self {
        Self::new(payload, SERVER_ID)
    }

    pub fn sync_request(client_id: &str) -> Self {
        Self::new(
            Payload::SyncRequest {
                client_id: Some(client_id.to_string()),
            },
            client_id,
        )
    }

    pub fn heartbeat(client_id: &str) -> Self {
        Self::new(Payload::Heartbeat, client_id)
    }

    pub fn pong() -> Self {
        Self::from_server(Payload::Pong)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::from_server(Payload::Error {
            message: message.into(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_from(&self, client_id: &str) -> bool {
        self.client_id == client_id
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut frame = Map::new();
        frame.insert("type".into(), Value::String(self.message_type().as_str().to_string()));
        frame.insert("data".into(), self.payload.to_data()?);
        frame.insert("timestamp".into(), Value::from(self.timestamp));
        frame.insert("clientId".into(), Value::String(self.client_id.clone()));
        if let Payload::Error { message } = &self.payload {
            frame.insert("message".into(), Value::String(message.clone()));
        }
        serde_json::to_string(&Value::Object(frame)).map_err(ProtocolError::Encode)
    }

    /// Decode a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let frame: RawFrame = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;
        let kind = MessageType::parse(&frame.kind).ok_or(ProtocolError::UnknownType(frame.kind))?;
        let payload = Payload::from_data(kind, frame.data, frame.message)?;
        Ok(Self {
            payload,
            timestamp: parse_timestamp(&frame.timestamp),
            client_id: frame.client_id.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minipos_core::TableStatus;

    fn roundtrip(payload: Payload) -> SyncMessage {
        let msg = SyncMessage::new(payload, "client_a");
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        decoded
    }

    #[test]
    fn test_wire_names_roundtrip() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::parse("connection"), Some(MessageType::ClientConnected));
        assert_eq!(MessageType::parse("NOPE"), None);
    }

    #[test]
    fn test_decode_table_add() {
        let raw = r#"{"type":"UPDATE_TABLE","data":{"action":"add","data":{"id":"5","number":5,"seats":4,"status":"available"}},"timestamp":1736930000000,"clientId":"client_a"}"#;
        let msg = SyncMessage::decode(raw).unwrap();
        assert_eq!(msg.timestamp, 1736930000000);
        assert_eq!(msg.client_id, "client_a");
        match msg.payload {
            Payload::UpdateTable(TableAction::Add(t)) => {
                assert_eq!(t.id, "5");
                assert_eq!(t.seats, 4);
                assert_eq!(t.status, TableStatus::Available);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_encode_shape() {
        let msg = SyncMessage::new(
            Payload::UpdateTable(TableAction::Delete(EntityRef::new("3"))),
            "client_a",
        );
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "UPDATE_TABLE");
        assert_eq!(value["data"]["action"], "delete");
        assert_eq!(value["data"]["data"]["id"], "3");
        assert_eq!(value["clientId"], "client_a");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_order_items_string_normalized() {
        let raw = r#"{"type":"UPDATE_ORDER","data":{"action":"add","data":{"id":"POS-01152025-001","items":"[{\"name\":\"Tea\",\"quantity\":1}]"}},"timestamp":0,"clientId":"b"}"#;
        let msg = SyncMessage::decode(raw).unwrap();
        match msg.payload {
            Payload::UpdateOrder(OrderAction::Add(order)) => {
                assert_eq!(order.items.0, vec![json!({"name": "Tea", "quantity": 1})]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_order_clear_and_menu_category() {
        roundtrip(Payload::UpdateOrder(OrderAction::Clear));
        roundtrip(Payload::UpdateMenu(MenuAction::AddCategory(CategoryRef {
            name: "Soups".into(),
        })));
    }

    #[test]
    fn test_user_sync_variants() {
        let raw = r#"{"type":"USER_SYNC","data":{"action":"users_broadcast","users":[{"id":"u4","username":"dan"}],"fromClient":"x"},"timestamp":0,"clientId":"x"}"#;
        match SyncMessage::decode(raw).unwrap().payload {
            Payload::UserSync(UserSyncAction::BroadcastUsers { users, from_client }) => {
                assert_eq!(users.len(), 1);
                assert_eq!(from_client.as_deref(), Some("x"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        roundtrip(Payload::UserSync(UserSyncAction::RequestUsers {
            client_id: Some("client_a".into()),
        }));
    }

    #[test]
    fn test_session_batch_roundtrip() {
        let session = ActiveSession {
            client_id: "client_a".into(),
            user_name: "admin".into(),
            ..Default::default()
        };
        let decoded = roundtrip(Payload::SessionSync(SessionBatch::new(
            SessionBatchKind::Broadcast,
            vec![session],
            Some("client_a".into()),
        )));
        assert_eq!(decoded.payload.action(), "broadcast_sessions");
    }

    #[test]
    fn test_unknown_type_and_action() {
        let err = SyncMessage::decode(r#"{"type":"MYSTERY","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "MYSTERY"));

        let err = SyncMessage::decode(r#"{"type":"UPDATE_TABLE","data":{"action":"explode"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction { .. }));

        let err = SyncMessage::decode(r#"{"type":"UPDATE_TABLE","data":{"action":"add"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(
            SyncMessage::decode("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SyncMessage::decode(r#"{"data":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_iso_timestamp_and_legacy_error() {
        let raw = r#"{"type":"error","message":"Invalid message format","timestamp":"2025-01-15T09:00:00.000Z"}"#;
        let msg = SyncMessage::decode(raw).unwrap();
        assert_eq!(msg.payload, Payload::Error { message: "Invalid message format".into() });
        assert_eq!(msg.timestamp, 1736931600000);
        assert_eq!(msg.client_id, "");
    }

    #[test]
    fn test_settings_must_be_object() {
        let err = SyncMessage::decode(r#"{"type":"UPDATE_SETTINGS","data":[1,2]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: MessageType::UpdateSettings, .. }));
    }

    #[test]
    fn test_mutation_classification() {
        assert!(MessageType::UpdateTable.is_mutation());
        assert!(MessageType::ForceLogout.is_mutation());
        assert!(!MessageType::SyncRequest.is_mutation());
        assert!(!MessageType::Heartbeat.is_mutation());
    }
}
