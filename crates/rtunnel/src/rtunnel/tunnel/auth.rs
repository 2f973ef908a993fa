//! Shared-secret proofs carried by Login, NewWorkConn, Ping and the visitor messages.
//!
//! A key is `hex(sha256(secret ++ timestamp))`. The relay accepts it only while the
//! timestamp is inside the replay window.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::rtunnel::tunnel::msg::{Login, NewWorkConn, Ping};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization failed")]
    BadKey,
    #[error("authorization timeout")]
    Expired,
    #[error("access denied for user {0:?}")]
    AclRejected(String),
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn auth_key(secret: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks `key` against `secret` and `timestamp`, with `window` of tolerated clock skew.
/// A zero window disables the timestamp check.
pub fn verify_key(
    secret: &str,
    key: &str,
    timestamp: i64,
    now: i64,
    window: Duration,
) -> Result<(), AuthError> {
    let window = window.as_secs();
    if window > 0 && now.abs_diff(timestamp) > window {
        return Err(AuthError::Expired);
    }
    if auth_key(secret, timestamp) != key {
        return Err(AuthError::BadKey);
    }
    Ok(())
}

/// Authentication oracle used by the relay for session-scoped proofs.
pub trait Authenticator: Send + Sync {
    fn verify_login(&self, m: &Login) -> Result<(), AuthError>;
    fn verify_ping(&self, m: &Ping) -> Result<(), AuthError>;
    fn verify_new_work_conn(&self, m: &NewWorkConn) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
pub struct TokenAuth {
    token: String,
    replay_window: Duration,
    authenticate_heartbeats: bool,
    trust_client_spec: bool,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>, replay_window: Duration) -> Self {
        Self {
            token: token.into(),
            replay_window,
            authenticate_heartbeats: false,
            trust_client_spec: false,
        }
    }

    pub fn with_heartbeats(mut self, on: bool) -> Self {
        self.authenticate_heartbeats = on;
        self
    }

    /// Honour `ClientSpec.always_auth_pass` on Login.
    pub fn with_trusted_client_spec(mut self, on: bool) -> Self {
        self.trust_client_spec = on;
        self
    }

    fn verify(&self, key: &str, timestamp: i64) -> Result<(), AuthError> {
        verify_key(&self.token, key, timestamp, now_unix(), self.replay_window)
    }
}

impl Authenticator for TokenAuth {
    fn verify_login(&self, m: &Login) -> Result<(), AuthError> {
        if self.trust_client_spec && m.client_spec.always_auth_pass {
            return Ok(());
        }
        self.verify(&m.privilege_key, m.timestamp)
    }

    fn verify_ping(&self, m: &Ping) -> Result<(), AuthError> {
        if !self.authenticate_heartbeats {
            return Ok(());
        }
        self.verify(&m.privilege_key, m.timestamp)
    }

    fn verify_new_work_conn(&self, m: &NewWorkConn) -> Result<(), AuthError> {
        self.verify(&m.privilege_key, m.timestamp)
    }
}

/// Access check for private proxies: the owner always passes, `*` admits everyone.
pub fn check_allow_users(owner: &str, allow_users: &[String], visitor: &str) -> Result<(), AuthError> {
    if visitor == owner {
        return Ok(());
    }
    if allow_users.iter().any(|u| u == "*" || u == visitor) {
        return Ok(());
    }
    Err(AuthError::AclRejected(visitor.to_string()))
}
