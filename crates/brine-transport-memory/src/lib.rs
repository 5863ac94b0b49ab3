//! In-memory transport using tokio channels.
//!
//! A [`MemoryHub`] stands in for the network: masters register under a name,
//! minions connect to that name. Suitable for:
//! - Tests of the master/minion/syndic flows
//! - Single process deployments
//!
//! Masters can be taken down and brought back to exercise failover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use brine_transport::{
    ClientTransport, Connection, Incoming, PubFrame, PubStream, Request, Response,
    ServerTransport, TransportError,
};
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

struct Endpoint {
    queue: Mutex<Option<mpsc::Sender<Incoming>>>,
    publish: broadcast::Sender<PubFrame>,
    up: AtomicBool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            queue: Mutex::new(None),
            publish: broadcast::channel(CHANNEL_CAPACITY).0,
            up: AtomicBool::new(true),
        }
    }

    fn queue(&self) -> Option<mpsc::Sender<Incoming>> {
        self.queue.lock().ok().and_then(|q| q.clone())
    }
}

/// Shared registry of in-process masters.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<DashMap<String, Arc<Endpoint>>>,
    unresolvable: Arc<DashSet<String>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server transport registered under `name`.
    pub fn server(&self, name: &str) -> MemoryServerTransport {
        let endpoint = self
            .endpoints
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Endpoint::new()))
            .clone();
        MemoryServerTransport { endpoint }
    }

    pub fn client(&self) -> MemoryClientTransport {
        MemoryClientTransport { hub: self.clone() }
    }

    /// Refuse (`false`) or accept (`true`) new connections and requests.
    pub fn set_up(&self, name: &str, up: bool) {
        if let Some(endpoint) = self.endpoints.get(name) {
            endpoint.up.store(up, Ordering::SeqCst);
        }
    }

    /// Make lookups of `name` fail like a DNS error.
    pub fn set_unresolvable(&self, name: &str, unresolvable: bool) {
        if unresolvable {
            self.unresolvable.insert(name.to_string());
        } else {
            self.unresolvable.remove(name);
        }
    }
}

// ───────────────────────────────────── Server ─────────────────────────────────────────

pub struct MemoryServerTransport {
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl ServerTransport for MemoryServerTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn serve(&self, queue: mpsc::Sender<Incoming>) -> Result<(), TransportError> {
        let mut slot = self
            .endpoint
            .queue
            .lock()
            .map_err(|_| TransportError::Closed)?;
        *slot = Some(queue);
        Ok(())
    }

    async fn publish(&self, frame: PubFrame) -> Result<(), TransportError> {
        // Ignore error if no receivers (this is fine)
        let _ = self.endpoint.publish.send(frame);
        Ok(())
    }
}

// ───────────────────────────────────── Client ─────────────────────────────────────────

pub struct MemoryClientTransport {
    hub: MemoryHub,
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    async fn connect(&self, master: &str) -> Result<Box<dyn Connection>, TransportError> {
        if self.hub.unresolvable.contains(master) {
            return Err(TransportError::Dns(master.to_string()));
        }
        let endpoint = self
            .hub
            .endpoints
            .get(master)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::ConnectionRefused(master.to_string()))?;
        if !endpoint.up.load(Ordering::SeqCst) || endpoint.queue().is_none() {
            return Err(TransportError::ConnectionRefused(master.to_string()));
        }
        debug!("Connected to in-process master {}", master);
        Ok(Box::new(MemoryConnection {
            master: master.to_string(),
            endpoint,
        }))
    }
}

struct MemoryConnection {
    master: String,
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn master(&self) -> &str {
        &self.master
    }

    async fn request(&self, req: &Request, timeout: Duration) -> Result<Response, TransportError> {
        if !self.endpoint.up.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(self.master.clone()));
        }
        let queue = self
            .endpoint
            .queue()
            .ok_or_else(|| TransportError::ConnectionRefused(self.master.clone()))?;
        let (tx, rx) = oneshot::channel();
        let incoming = Incoming {
            request: req.clone(),
            peer: format!("memory:{}", self.master),
            reply: tx,
        };
        queue
            .send(incoming)
            .await
            .map_err(|_| TransportError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn subscribe(&self) -> Result<PubStream, TransportError> {
        if !self.endpoint.up.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(self.master.clone()));
        }
        let rx = self.endpoint.publish.subscribe();
        // Lagged subscribers skip what they missed
        let stream = BroadcastStream::new(rx).filter_map(|result| result.ok());
        Ok(Box::pin(stream))
    }
}
