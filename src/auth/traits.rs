use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid timestamp in token")]
    InvalidTimestamp,
    #[error("stale token")]
    Expired,
    #[error("token HMAC doesn't match")]
    IntegrityFailure,
}

/// Who a connection is and which part of the topic space it may touch.
///
/// Fixed at handshake time and never changed by anything the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub identity: String,
    pub subscribe_prefix: String,
    pub publish_prefix: String,
}

/// Validates the bearer token presented during the WebSocket handshake.
///
/// Runs inside the handshake callback, so it is synchronous and must not
/// block.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str, now: SystemTime) -> Result<ConnectionIdentity, AuthError>;
}
