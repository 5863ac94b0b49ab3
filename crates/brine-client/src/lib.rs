//! Minion side of brine.
//!
//! - [`keys`]: the minion key pair and the cached master key
//! - [`auth`]: the handshake and verification of the master
//! - [`fsm`]: the reconnect / failover / fail-back state machine
//! - [`link`]: an authenticated link that seals every request
//! - [`driver`]: runs the state machine against a real transport

use brine_crypto::SignatureError;
use brine_transport::secure::SealError;
use brine_transport::TransportError;
use thiserror::Error;

pub mod auth;
pub mod backoff;
pub mod driver;
pub mod fsm;
pub mod keys;
pub mod link;
pub mod masters;

pub use auth::{session_aad, Authenticator, Session};
pub use backoff::Backoff;
pub use driver::{Driver, LinkHandler};
pub use fsm::{Action, ConnState, ConnectPolicy, ConnectionManager, Event, StopReason};
pub use keys::MinionKeys;
pub use link::MasterLink;
pub use masters::{distributed_index, ordered_masters};

/// The master could not be trusted. Never retried, never folded into a
/// transport error.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("master fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("master did not sign its public key")]
    MissingSignature,
    #[error("master key signature invalid: {0}")]
    BadSignature(SignatureError),
    #[error("master key changed since the last connection")]
    MasterKeyChanged,
    #[error("malformed master public key")]
    MalformedMasterKey,
    #[error("master signing key unavailable at {0}")]
    MissingSigningKey(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("key pending acceptance")]
    Pending,
    #[error("key rejected")]
    Rejected,
    #[error("master is full")]
    Full,
    #[error("trust failure: {0}")]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("key storage: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Worth another attempt later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Pending | AuthError::Full | AuthError::Transport(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error("session expired")]
    Reauth,
    #[error("publish for stale session version {0}")]
    Stale(u64),
    #[error("master error: {0}")]
    Master(String),
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("stopped: {0}")]
    Stopped(StopReason),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_errors_are_never_retryable() {
        let trust = AuthError::from(TrustError::MasterKeyChanged);
        assert!(!trust.is_retryable());
        assert!(!AuthError::Rejected.is_retryable());
        assert!(AuthError::Pending.is_retryable());
        assert!(AuthError::from(TransportError::Closed).is_retryable());
    }
}
