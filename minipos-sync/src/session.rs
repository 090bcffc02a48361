//! Login sessions and user lists across terminals.
//!
//! Builds the session frames a terminal sends and decides how it reacts to
//! the ones it receives:
//!
//! | Frame               | Receiver reaction                                  |
//! |---------------------|----------------------------------------------------|
//! | `REFRESH_SESSIONS`  | re-broadcast own session view after a random delay |
//! | `TERMINATE_SESSION` | if addressed here: end the local session           |
//! | `FORCE_LOGOUT`      | if addressed here: end the local session, hard     |
//!
//! The credential check is a local lookup for the login screen. It is not a
//! security boundary.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;

use minipos_core::store::keys;
use minipos_core::{defaults, ActiveSession, KeyValueStore, KeyValueStoreExt, StoreError, User};

use crate::protocol::{
    ForcedLogout, LogoutNotice, Payload, RefreshRequest, SessionBatch, SessionBatchKind, SyncMessage, Termination,
    UserSyncAction,
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lower bound of the delay before answering `REFRESH_SESSIONS`
    pub refresh_jitter_min: Duration,
    /// Upper bound of the same delay
    pub refresh_jitter_max: Duration,
    /// Delay between a local user change and the full-list broadcast
    pub user_broadcast_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_jitter_min: Duration::from_millis(100),
            refresh_jitter_max: Duration::from_millis(400),
            user_broadcast_delay: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Random delay in `[refresh_jitter_min, refresh_jitter_max]`.
    pub fn refresh_delay(&self) -> Duration {
        let (lo, hi) = (self.refresh_jitter_min, self.refresh_jitter_max);
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

/// Device description stored with a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_type: String,
    pub browser: String,
    pub os: String,
}

impl DeviceInfo {
    pub fn detect() -> Self {
        Self {
            device_type: "Desktop".to_string(),
            browser: format!("minipos/{}", env!("CARGO_PKG_VERSION")),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// How a terminal should react to a received frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDirective {
    Ignore,
    /// Send own session list after `delay`
    Rebroadcast { delay: Duration },
    /// This terminal's session was ended remotely
    Terminate { reason: Option<String>, forced: bool },
}

/// Session frames for one terminal.
#[derive(Debug, Clone)]
pub struct SessionProtocol {
    client_id: String,
    config: SessionConfig,
    device: DeviceInfo,
}

impl SessionProtocol {
    pub fn new(client_id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            device: DeviceInfo::detect(),
        }
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn directive_for(&self, msg: &SyncMessage) -> SessionDirective {
        match &msg.payload {
            Payload::RefreshSessions(req) => {
                if req.requested_by.as_deref() == Some(self.client_id.as_str()) {
                    SessionDirective::Ignore
                } else {
                    SessionDirective::Rebroadcast {
                        delay: self.config.refresh_delay(),
                    }
                }
            }
            Payload::TerminateSession(t) if t.client_id == self.client_id => SessionDirective::Terminate {
                reason: t.reason.clone(),
                forced: false,
            },
            Payload::ForceLogout(f) if f.target_client_id == self.client_id => SessionDirective::Terminate {
                reason: f.reason.clone(),
                forced: true,
            },
            _ => SessionDirective::Ignore,
        }
    }

    /// Session record for `user` logging in on this terminal.
    pub fn session_for(&self, user: &User) -> ActiveSession {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        ActiveSession {
            client_id: self.client_id.clone(),
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            user_role: user.role_id.clone(),
            login_time: now.clone(),
            last_activity: now,
            device_type: self.device.device_type.clone(),
            browser: self.device.browser.clone(),
            os: self.device.os.clone(),
            ..Default::default()
        }
    }

    pub fn login(&self, session: ActiveSession) -> Payload {
        Payload::UserLogin(session)
    }

    pub fn logout(&self, user: &User) -> Payload {
        Payload::UserLogout(LogoutNotice {
            client_id: self.client_id.clone(),
            user_name: user.name.clone(),
            user_role: user.role_id.clone(),
        })
    }

    pub fn refresh_request(&self) -> Payload {
        Payload::RefreshSessions(RefreshRequest {
            requested_by: Some(self.client_id.clone()),
        })
    }

    /// This terminal's view of all sessions, answering a refresh.
    pub fn session_update(&self, sessions: Vec<ActiveSession>) -> Payload {
        Payload::SessionUpdate(SessionBatch::new(
            SessionBatchKind::ListUpdated,
            sessions,
            Some(self.client_id.clone()),
        ))
    }

    pub fn session_sync(&self, sessions: Vec<ActiveSession>) -> Payload {
        Payload::SessionSync(SessionBatch::new(
            SessionBatchKind::Broadcast,
            sessions,
            Some(self.client_id.clone()),
        ))
    }

    pub fn terminate(&self, target: &str, reason: Option<String>) -> Payload {
        Payload::TerminateSession(Termination {
            client_id: target.to_string(),
            reason,
        })
    }

    pub fn force_logout(&self, target: &str, reason: Option<String>) -> Payload {
        Payload::ForceLogout(ForcedLogout {
            target_client_id: target.to_string(),
            reason,
        })
    }

    pub fn request_users(&self) -> Payload {
        Payload::UserSync(UserSyncAction::RequestUsers {
            client_id: Some(self.client_id.clone()),
        })
    }

    pub fn broadcast_users(&self, users: Vec<User>) -> Payload {
        Payload::UserSync(UserSyncAction::BroadcastUsers {
            users,
            from_client: Some(self.client_id.clone()),
        })
    }
}

/// Finds an active user by username, display name or email (case
/// insensitive) with a matching password.
pub fn authenticate<'a>(users: &'a [User], login: &str, password: &str) -> Option<&'a User> {
    let login = login.trim();
    if login.is_empty() {
        return None;
    }
    users.iter().find(|u| {
        u.is_active
            && u.password == password
            && (u.username.eq_ignore_ascii_case(login)
                || u.name.eq_ignore_ascii_case(login)
                || u.email.eq_ignore_ascii_case(login))
    })
}

pub fn save_credentials<S: KeyValueStore + ?Sized>(store: &S, user: &User) -> Result<(), StoreError> {
    store.save(keys::IS_LOGGED_IN, &true)?;
    store.save(keys::CURRENT_USER, user)?;
    store.save(keys::CURRENT_USER_ROLE, &user.role_id)?;
    store.save(keys::CURRENT_USER_PERMISSIONS, defaults::role_permissions(&user.role_id))?;
    Ok(())
}

/// Removes the login keys, and the remembered tab when `include_tab`.
pub fn clear_credentials<S: KeyValueStore + ?Sized>(store: &S, include_tab: bool) -> Result<(), StoreError> {
    for key in keys::CREDENTIALS {
        store.remove(key)?;
    }
    if include_tab {
        store.remove(keys::ACTIVE_TAB)?;
    }
    Ok(())
}

pub fn current_user<S: KeyValueStore + ?Sized>(store: &S) -> Result<Option<User>, StoreError> {
    if store.load::<bool>(keys::IS_LOGGED_IN)? != Some(true) {
        return Ok(None);
    }
    store.load(keys::CURRENT_USER)
}

/// Reads and clears the flag left by a remote termination.
pub fn take_terminated_flag<S: KeyValueStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    let flagged = matches!(store.load::<bool>(keys::SESSION_TERMINATED), Ok(Some(true)));
    store.remove(keys::SESSION_TERMINATED)?;
    Ok(flagged)
}
