//! Links from this master to its upper masters.
//!
//! Each `syndic_master` entry gets its own connection driver, so a stalled
//! upper never holds up the others. Jobs published upstairs are re-published
//! locally under the same JID; every return this master accepts is forwarded
//! to each upper, buffered while that upper is unreachable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brine_client::{
    Authenticator, Backoff, ConnectPolicy, ConnectionManager, Driver, LinkHandler, MasterLink,
    MinionKeys,
};
use brine_config::{MasterConfig, MasterType, SyndicFailover, TransportKind};
use brine_storage::{Job, JobReturn, MinionId};
use brine_transport::{ClientTransport, MinionReply, MinionRequest, PublishLoad, PublishRequest};
use brine_transport_tcp::{TcpClientOptions, TcpClientTransport};
use rand::seq::SliceRandom;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::memcache::MemCache;
use crate::publisher::{publish_job, PublishError};
use crate::server::{MasterServer, ServerError};

const AUTH_TIMEOUT: Duration = Duration::from_secs(60);

fn upstream_policy() -> ConnectPolicy {
    ConnectPolicy {
        master_type: MasterType::Str,
        tries_per_master: None,
        alive_interval: Some(Duration::from_secs(30)),
        failback_interval: None,
        retry_dns: Duration::from_secs(30),
        retry_dns_count: None,
        acceptance_wait: Duration::from_secs(10),
        acceptance_wait_max: Duration::from_secs(60),
        rejected_retry: true,
        startup_delay: Duration::ZERO,
    }
}

/// Upper masters in the order their links are brought up.
pub fn upper_masters(config: &MasterConfig) -> Vec<String> {
    let mut uppers = config.syndic_master.clone();
    if config.syndic_failover == SyndicFailover::Random {
        uppers.shuffle(&mut rand::rng());
    }
    uppers
}

/// Client transport used to reach the upper masters.
pub fn upstream_transport(config: &MasterConfig) -> Result<Arc<dyn ClientTransport>, ServerError> {
    match config.transport {
        TransportKind::Tcp => Ok(Arc::new(TcpClientTransport::new(TcpClientOptions {
            publish_port: config.syndic_master_publish_port,
            ret_port: config.syndic_master_port,
            source_address: None,
            source_publish_port: None,
            source_ret_port: None,
        }))),
        TransportKind::Memory => Err(ServerError::Unsupported(
            "syndic links need a network transport".into(),
        )),
    }
}

fn key_dir_name(upper: &str) -> String {
    upper
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Connect to every configured upper master over the network.
pub async fn spawn_syndics(
    server: &MasterServer,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, ServerError> {
    if server.config.syndic_master.is_empty() {
        return Ok(Vec::new());
    }
    let transport = upstream_transport(&server.config)?;
    let mut handles = Vec::new();
    for upper in upper_masters(&server.config) {
        // Keys per upper: each one pins its own master key.
        let dir = server
            .config
            .pki_dir
            .join("syndic")
            .join(key_dir_name(&upper));
        let keys = MinionKeys::load_or_generate(&dir).await?;
        let (_, spawned) = spawn_upstream(server, transport.clone(), keys, upper, shutdown.clone());
        handles.extend(spawned);
    }
    Ok(handles)
}

/// Start the driver and the return forwarder for one upper master.
pub fn spawn_upstream(
    server: &MasterServer,
    transport: Arc<dyn ClientTransport>,
    keys: MinionKeys,
    upper: String,
    shutdown: watch::Receiver<bool>,
) -> (Arc<Upstream>, Vec<JoinHandle<()>>) {
    let auth = Arc::new(Authenticator::new(
        MinionId::from(server.config.id.as_str()),
        keys,
        server.config.hash_type,
        AUTH_TIMEOUT,
    )
    .as_syndic());
    let backoff = Backoff::from_recon(1000, 10_000, true, &mut rand::rng());
    let manager = ConnectionManager::new(upstream_policy(), vec![upper.clone()], backoff);
    let upstream = Arc::new(Upstream::new(server.clone(), upper.clone()));

    let driver = Driver::new(transport, auth, manager, upstream.clone());
    let driver_upper = upper.clone();
    let driver_shutdown = shutdown.clone();
    let driving = tokio::spawn(async move {
        if let Err(e) = driver.run(driver_shutdown).await {
            error!(upper = %driver_upper, error = %e, "syndic link stopped");
        }
    });

    let forwarding = tokio::spawn(forward_returns(
        upstream.clone(),
        server.returns.subscribe(),
        shutdown,
    ));
    info!(upper = %upper, "syndic link started");
    (upstream, vec![driving, forwarding])
}

async fn forward_returns(
    upstream: Arc<Upstream>,
    mut returns: tokio::sync::broadcast::Receiver<JobReturn>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ret = returns.recv() => match ret {
                Ok(ret) => upstream.forward(ret).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(upper = %upstream.upper, skipped, "return relay fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// State for one upper master.
pub struct Upstream {
    server: MasterServer,
    upper: String,
    cache: Arc<Mutex<MemCache>>,
    link: RwLock<Option<Arc<MasterLink>>>,
    backlog: Mutex<VecDeque<JobReturn>>,
    capacity: usize,
}

impl Upstream {
    pub fn new(server: MasterServer, upper: String) -> Self {
        let cache = MemCache::from_config(server.store.clone(), &server.config);
        let capacity = server.config.syndic_buffer_size;
        Self {
            server,
            upper,
            cache: Arc::new(Mutex::new(cache)),
            link: RwLock::new(None),
            backlog: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link.read().await.is_some()
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Send `ret` upstairs, or keep it until the link is back.
    pub async fn forward(&self, ret: JobReturn) {
        let link = self.link.read().await.clone();
        match link {
            Some(link) => {
                let mut batch: Vec<JobReturn> = self.backlog.lock().await.drain(..).collect();
                batch.push(ret);
                self.send(&link, batch).await;
            }
            None => self.requeue(vec![ret]).await,
        }
    }

    async fn send(&self, link: &MasterLink, batch: Vec<JobReturn>) {
        if batch.is_empty() {
            return;
        }
        let request = MinionRequest::SyndicReturn {
            returns: batch.clone(),
        };
        match link.request(&request).await {
            Ok(MinionReply::Ack) => {
                debug!(upper = %self.upper, count = batch.len(), "returns forwarded");
            }
            Ok(other) => {
                warn!(upper = %self.upper, reply = ?other, "upper master refused returns");
                self.requeue(batch).await;
            }
            Err(e) => {
                warn!(upper = %self.upper, error = %e, "could not forward returns");
                self.requeue(batch).await;
            }
        }
    }

    /// Put `batch` back at the front; the oldest entries go first when full.
    async fn requeue(&self, batch: Vec<JobReturn>) {
        let mut backlog = self.backlog.lock().await;
        for ret in batch.into_iter().rev() {
            backlog.push_front(ret);
        }
        let mut dropped = 0;
        while backlog.len() > self.capacity {
            backlog.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(upper = %self.upper, dropped, "return buffer full, dropped oldest");
        }
    }
}

/// Re-publish one upper job under its own JID and tell the upper which
/// minions will answer.
async fn relay(
    server: MasterServer,
    cache: Arc<Mutex<MemCache>>,
    upper: String,
    link: Arc<MasterLink>,
    job: Job,
) {
    let jid = job.jid.clone();
    let request = PublishRequest {
        target: job.target,
        fun: job.fun,
        args: job.args,
        user: job.user,
        token: None,
        jid: Some(job.jid),
        origin: Some(upper.clone()),
    };
    let published = {
        let mut cache = cache.lock().await;
        publish_job(&server, &mut cache, request, true).await
    };
    match published {
        Ok(reply) => {
            let report = MinionRequest::SyndicMinions {
                jid: reply.jid,
                minions: reply.minions,
            };
            if let Err(e) = link.request(&report).await {
                warn!(%jid, upper = %upper, error = %e, "could not report expected minions");
            }
        }
        Err(PublishError::NoMinions) => debug!(%jid, "relayed job matched nothing here"),
        Err(e) => warn!(%jid, upper = %upper, error = %e, "could not relay job"),
    }
}

#[async_trait]
impl LinkHandler for Upstream {
    async fn connected(&self, link: Arc<MasterLink>) {
        info!(upper = %self.upper, "connected to upper master");
        *self.link.write().await = Some(link.clone());
        let pending: Vec<JobReturn> = self.backlog.lock().await.drain(..).collect();
        if !pending.is_empty() {
            info!(upper = %self.upper, count = pending.len(), "replaying buffered returns");
            self.send(&link, pending).await;
        }
    }

    async fn publish(&self, link: Arc<MasterLink>, load: PublishLoad) {
        debug!(upper = %self.upper, jid = %load.job.jid, fun = %load.job.fun, "job from upper master");
        tokio::spawn(relay(
            self.server.clone(),
            self.cache.clone(),
            self.upper.clone(),
            link,
            load.job,
        ));
    }

    async fn disconnected(&self, master: &str) {
        info!(upper = %master, "disconnected from upper master");
        self.link.write().await.take();
    }
}
