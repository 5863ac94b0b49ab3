use std::sync::Arc;

use brine_config::{IpcMode, MasterConfig, TransportKind};
use brine_pillar::{Fileserver, PillarCompiler, PillarError};
use brine_storage::{JobReturn, MinionId, StoreError};
use brine_transport::{ServerTransport, TransportError};
use brine_transport_tcp::{IpcEndpoint, IpcServer, TcpServerOptions, TcpServerTransport};
use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::acl::PublisherAcl;
use crate::backend::StoreBackend;
use crate::job_cache::JobCache;
use crate::keys::KeyManager;
use crate::maintenance::Maintenance;
use crate::metrics::record_session_version;
use crate::presence::Presence;
use crate::session::{MasterIdentity, SessionKeyring};
use crate::{syndic, workers};

const QUEUE_DEPTH: usize = 1024;
const RETURN_FANOUT: usize = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pillar(#[from] PillarError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unsupported(String),
}

/// Everything a worker needs, cheap to clone.
#[derive(Clone)]
pub struct MasterServer {
    pub config: Arc<MasterConfig>,
    pub store: StoreBackend,
    pub sessions: Arc<SessionKeyring>,
    pub identity: Arc<MasterIdentity>,
    pub keys: Arc<KeyManager>,
    pub jobs: Arc<JobCache>,
    pub acl: Arc<PublisherAcl>,
    pub fileserver: Arc<Fileserver>,
    pub pillar: Arc<PillarCompiler>,
    pub presence: Arc<Presence>,
    /// Minions that last authenticated as syndics.
    pub syndics: Arc<DashSet<MinionId>>,
    pub transports: Arc<Vec<Arc<dyn ServerTransport>>>,
    pub root_token: Arc<String>,
    /// Every return accepted by this master, for relaying to upper masters.
    pub returns: broadcast::Sender<JobReturn>,
}

impl MasterServer {
    pub fn new(
        config: MasterConfig,
        store: StoreBackend,
        identity: MasterIdentity,
        root_token: String,
        transports: Vec<Arc<dyn ServerTransport>>,
    ) -> Result<Self, ServerError> {
        let sessions = Arc::new(SessionKeyring::new());
        let keys = KeyManager::new(store.clone(), sessions.clone(), &config);
        let jobs = JobCache::new(store.clone(), &config);
        let acl = PublisherAcl::from_config(&config);
        let fileserver = Fileserver::from_config(&config)?;
        let pillar = PillarCompiler::from_config(&config);
        let presence = Presence::new(std::time::Duration::from_secs(config.presence_window));
        let (returns, _) = broadcast::channel(RETURN_FANOUT);
        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            identity: Arc::new(identity),
            keys: Arc::new(keys),
            jobs: Arc::new(jobs),
            acl: Arc::new(acl),
            fileserver: Arc::new(fileserver),
            pillar: Arc::new(pillar),
            presence: Arc::new(presence),
            syndics: Arc::new(DashSet::new()),
            transports: Arc::new(transports),
            root_token: Arc::new(root_token),
            returns,
        })
    }

    /// Whether `token` is the local root token.
    pub fn is_root_token(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| !t.is_empty() && t == self.root_token.as_str())
    }
}

/// Local client endpoint for `config`.
pub fn ipc_endpoint(config: &MasterConfig) -> IpcEndpoint {
    match config.ipc_mode {
        IpcMode::Ipc => IpcEndpoint::Unix(config.sock_dir.join("master_ipc.sock")),
        IpcMode::Tcp => IpcEndpoint::Tcp(config.tcp_master_workers),
    }
}

/// Bind the network transport named by `transport`.
pub async fn bind_transport(config: &MasterConfig) -> Result<Arc<dyn ServerTransport>, ServerError> {
    match config.transport {
        TransportKind::Tcp => {
            let transport = TcpServerTransport::bind(&TcpServerOptions {
                interface: config.interface,
                publish_port: config.publish_port,
                ret_port: config.ret_port,
            })
            .await?;
            Ok(Arc::new(transport))
        }
        TransportKind::Memory => Err(ServerError::Unsupported(
            "the memory transport only works inside a single process".into(),
        )),
    }
}

/// Start listening, the worker pool, the maintenance loop and any syndic
/// links. Returns once everything is running.
pub async fn start(
    server: &MasterServer,
    ipc: Option<IpcEndpoint>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, ServerError> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    for transport in server.transports.iter() {
        transport.serve(tx.clone()).await?;
        info!(transport = transport.kind(), "transport serving");
    }
    if let Some(endpoint) = ipc {
        if let IpcEndpoint::Unix(path) = &endpoint {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        IpcServer::new(endpoint).serve(tx.clone()).await?;
    }
    drop(tx);

    record_session_version(server.sessions.current().version);

    let mut handles = workers::spawn_workers(server.clone(), rx, shutdown.clone());
    let maintenance = Maintenance::new(server.clone());
    handles.push(tokio::spawn(maintenance.run(shutdown.clone())));
    handles.extend(syndic::spawn_syndics(server, shutdown).await?);

    info!(
        id = %server.config.id,
        workers = server.config.worker_threads,
        store = server.store.kind(),
        "master started"
    );
    Ok(handles)
}
