use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::traits::{AuthError, Authenticator, ConnectionIdentity};

type HmacSha1 = Hmac<Sha1>;

/// A parsed bearer token.
///
/// Wire form is seven colon-separated fields:
/// `identity:subscribe_prefix:publish_prefix:issued_at:nonce:source_address:hex_digest`,
/// for example `anp8:gobot:gobot.browser.anp8:1344361884:667494:127.0.0.1:306233f6...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub identity: &'a str,
    pub subscribe_prefix: &'a str,
    pub publish_prefix: &'a str,
    pub issued_at: i64,
    pub nonce: &'a str,
    /// Not checked against the peer address
    pub source_address: &'a str,
    pub digest: &'a str,
}

impl<'a> Token<'a> {
    pub fn parse(raw: &'a str) -> Result<Self, AuthError> {
        let fields: Vec<&str> = raw.split(':').collect();
        let [identity, subscribe_prefix, publish_prefix, issued_at, nonce, source_address, digest] =
            <[&str; 7]>::try_from(fields).map_err(|fields| {
                debug!(fields = fields.len(), "token has wrong number of fields");
                AuthError::InvalidFormat
            })?;

        let issued_at = issued_at.parse::<i64>().map_err(|e| {
            debug!(timestamp_field = issued_at, error = %e, "invalid timestamp in token");
            AuthError::InvalidTimestamp
        })?;

        Ok(Self {
            identity,
            subscribe_prefix,
            publish_prefix,
            issued_at,
            nonce,
            source_address,
            digest,
        })
    }

    /// The fields the digest covers, with the timestamp rendered in decimal
    /// as parsed. `0123` and `123` therefore sign the same payload.
    fn signed_payload(&self) -> String {
        signed_payload(
            self.identity,
            self.subscribe_prefix,
            self.publish_prefix,
            self.issued_at,
            self.nonce,
            self.source_address,
        )
    }
}

fn signed_payload(
    identity: &str,
    subscribe_prefix: &str,
    publish_prefix: &str,
    issued_at: i64,
    nonce: &str,
    source_address: &str,
) -> String {
    format!("{identity}:{subscribe_prefix}:{publish_prefix}:{issued_at}:{nonce}:{source_address}")
}

/// Errors raised while building or issuing tokens, as opposed to
/// [`AuthError`] which is about a token presented by a client
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token field `{0}` must not contain ':'")]
    InvalidField(&'static str),
    #[error("Secret is not usable as an HMAC key")]
    InvalidKey,
}

/// HMAC-SHA1 token validation against a shared secret.
///
/// Only tokens older than the window are rejected; a token dated in the
/// future is accepted. The claimed source address is carried but never
/// compared with the transport peer.
#[derive(Clone)]
pub struct TokenAuthenticator {
    mac: HmacSha1,
    window: Duration,
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl TokenAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>, window: Duration) -> Result<Self, TokenError> {
        let mac = HmacSha1::new_from_slice(secret.as_ref()).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self { mac, window })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Parse and check a token at `now`.
    ///
    /// Checks run in a fixed order: field count, timestamp syntax, age, digest.
    pub fn validate(&self, raw: &str, now: SystemTime) -> Result<ConnectionIdentity, AuthError> {
        let token = Token::parse(raw)?;

        let now_secs = unix_seconds(now);
        let window_secs = i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX);
        if now_secs.saturating_sub(token.issued_at) > window_secs {
            debug!(issued_at = token.issued_at, now = now_secs, "stale token");
            return Err(AuthError::Expired);
        }

        let provided = hex::decode(token.digest).map_err(|_| AuthError::IntegrityFailure)?;
        let mut mac = self.mac.clone();
        mac.update(token.signed_payload().as_bytes());
        mac.verify_slice(&provided).map_err(|_| {
            warn!(identity = token.identity, "token HMAC doesn't match");
            AuthError::IntegrityFailure
        })?;

        Ok(ConnectionIdentity {
            identity: token.identity.to_string(),
            subscribe_prefix: token.subscribe_prefix.to_string(),
            publish_prefix: token.publish_prefix.to_string(),
        })
    }

    /// Produce a signed token the way the issuer does.
    ///
    /// Refuses any field containing `:`, since the result would not parse.
    pub fn issue(
        &self,
        identity: &str,
        subscribe_prefix: &str,
        publish_prefix: &str,
        issued_at: i64,
        nonce: &str,
        source_address: &str,
    ) -> Result<String, TokenError> {
        let fields = [
            ("identity", identity),
            ("subscribe_prefix", subscribe_prefix),
            ("publish_prefix", publish_prefix),
            ("nonce", nonce),
            ("source_address", source_address),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| value.contains(':')) {
            return Err(TokenError::InvalidField(*name));
        }

        let payload = signed_payload(
            identity,
            subscribe_prefix,
            publish_prefix,
            issued_at,
            nonce,
            source_address,
        );
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{payload}:{digest}"))
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str, now: SystemTime) -> Result<ConnectionIdentity, AuthError> {
        self.validate(token, now)
    }
}

pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_secs()).unwrap_or(i64::MAX),
    }
}
