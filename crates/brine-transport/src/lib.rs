//! Transport abstraction for brine.
//!
//! A transport provides two channels between a master and its minions:
//! - a publish channel that fans every [`PubFrame`] out to all subscribers
//! - a request channel carrying [`Request`]/[`Response`] pairs
//!
//! Implementations:
//! - Memory (single process, tokio channels), used by tests
//! - TCP (length-prefixed JSON frames on the publish and return ports)

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod codec;
mod message;
pub mod secure;

pub use message::*;

/// Error type for transport operations.
///
/// Every variant is transient from the caller's point of view; trust failures
/// are reported by the authentication layer, never through this type.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {0}")]
    Dns(String),
    #[error("connection refused by {0}")]
    ConnectionRefused(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_dns(&self) -> bool {
        matches!(self, TransportError::Dns(_))
    }
}

/// A request waiting for a worker, with the channel its reply goes back on.
pub struct Incoming {
    pub request: Request,
    pub peer: String,
    pub reply: oneshot::Sender<Response>,
}

/// Stream of publish frames
pub type PubStream = Pin<Box<dyn Stream<Item = PubFrame> + Send>>;

/// Master side of a transport.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Short name used in logs and metrics labels.
    fn kind(&self) -> &'static str;

    /// Start accepting requests. Every request is pushed onto `queue`; the
    /// call returns once the listeners are running.
    async fn serve(&self, queue: mpsc::Sender<Incoming>) -> Result<(), TransportError>;

    /// Broadcast a frame to every connected subscriber.
    ///
    /// Having no subscribers is not an error.
    async fn publish(&self, frame: PubFrame) -> Result<(), TransportError>;
}

/// Minion side of a transport.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Open both channels to `master` (a host, `host:port`, or hub name).
    async fn connect(&self, master: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// An open link to one master.
#[async_trait]
pub trait Connection: Send + Sync {
    fn master(&self) -> &str;

    /// Send one request and wait at most `timeout` for the reply.
    async fn request(&self, req: &Request, timeout: Duration) -> Result<Response, TransportError>;

    /// Subscribe to the master's publish channel.
    async fn subscribe(&self) -> Result<PubStream, TransportError>;
}
