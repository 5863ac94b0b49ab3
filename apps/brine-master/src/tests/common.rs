//! Common test helpers.
//!
//! Every master built here keeps its stores in memory, its keys and roots
//! under a temp dir, and talks over a [`MemoryHub`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use brine_config::MasterConfig;
use brine_crypto::Keypair;
use brine_storage::{Jid, JobReturn, MinionId, Target};
use brine_transport::secure::{open, seal};
use brine_transport::{
    AuthRequest, MinionReply, MinionRequest, PublishRequest, Request, Response, ServerTransport,
};
use brine_transport_memory::MemoryHub;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::handlers;
use crate::memcache::MemCache;
use crate::server::{self, MasterServer};
use crate::session::MasterIdentity;

pub const ROOT_TOKEN: &str = "root-token";
/// Peer name the IPC server gives local clients.
pub const LOCAL_PEER: &str = "ipc:local";
pub const REMOTE_PEER: &str = "memory:master";

pub fn master_config(dir: &Path, extra: &str) -> MasterConfig {
    for sub in ["pki", "cache", "srv/salt", "srv/pillar"] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    let d = dir.display();
    let yaml = format!(
        "transport: memory\n\
         cache: memory\n\
         pki_dir: {d}/pki\n\
         cachedir: {d}/cache\n\
         sock_dir: {d}/sock\n\
         file_roots:\n  base:\n    - {d}/srv/salt\n\
         pillar_roots:\n  base:\n    - {d}/srv/pillar\n\
         {extra}"
    );
    MasterConfig::from_yaml_str(&yaml).unwrap()
}

/// A master registered on `hub` under `name`. Not serving yet.
pub async fn memory_server_on(hub: &MemoryHub, name: &str, extra: &str) -> (TempDir, MasterServer) {
    let dir = tempfile::tempdir().unwrap();
    let config = master_config(dir.path(), extra);
    let store = crate::backend::StoreBackend::from_config(&config).await.unwrap();
    let identity = MasterIdentity::load(&config).await.unwrap();
    let transport: Arc<dyn ServerTransport> = Arc::new(hub.server(name));
    let server =
        MasterServer::new(config, store, identity, ROOT_TOKEN.into(), vec![transport]).unwrap();
    (dir, server)
}

/// A master on a private hub.
pub async fn memory_server(extra: &str) -> (TempDir, MasterServer) {
    memory_server_on(&MemoryHub::new(), "master", extra).await
}

/// Start the worker pool and the maintenance loop without the local socket.
pub async fn serve(server: &MasterServer) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (tx, rx) = watch::channel(false);
    let handles = server::start(server, None, rx).await.unwrap();
    (tx, handles)
}

/// Run one request through the dispatcher as a worker would.
pub async fn dispatch_as(server: &MasterServer, request: Request, peer: &str) -> Response {
    let mut cache = MemCache::from_config(server.store.clone(), &server.config);
    handlers::dispatch(server, &mut cache, request, peer).await
}

pub async fn local(server: &MasterServer, request: Request) -> Response {
    dispatch_as(server, request, LOCAL_PEER).await
}

pub async fn remote(server: &MasterServer, request: Request) -> Response {
    dispatch_as(server, request, REMOTE_PEER).await
}

pub fn auth_request(id: &str, keypair: &Keypair) -> Request {
    Request::Auth(AuthRequest {
        id: MinionId::from(id),
        public_key: keypair.public_key_bytes().to_vec(),
        autosign_grains: BTreeMap::new(),
        syndic: false,
    })
}

/// Present a fresh key for `id` and accept it.
pub async fn accepted_minion(server: &MasterServer, id: &str) -> Keypair {
    let keypair = Keypair::generate();
    remote(server, auth_request(id, &keypair)).await;
    server.keys.accept(id, false).await.unwrap();
    keypair
}

/// Like [`accepted_minion`], then authenticate again as a syndic.
pub async fn accepted_syndic(server: &MasterServer, id: &str) -> Keypair {
    let keypair = accepted_minion(server, id).await;
    let Request::Auth(mut req) = auth_request(id, &keypair) else {
        unreachable!();
    };
    req.syndic = true;
    assert!(matches!(
        remote(server, Request::Auth(req)).await,
        Response::Auth(_)
    ));
    keypair
}

/// Seal `msg` as minion `id` under the current session and open the reply.
pub async fn sealed(server: &MasterServer, id: &str, msg: &MinionRequest) -> MinionReply {
    let session = server.sessions.current();
    let request = seal(&session.key, session.version, &MinionId::from(id), msg).unwrap();
    match remote(server, Request::Secure(request)).await {
        Response::Secure(reply) => open(&session.key, &reply).unwrap(),
        other => panic!("expected a sealed reply, got {other:?}"),
    }
}

pub fn publish_request(target: Target, fun: &str) -> PublishRequest {
    PublishRequest {
        target,
        fun: fun.into(),
        args: vec![],
        user: "root".into(),
        token: Some(ROOT_TOKEN.into()),
        jid: None,
        origin: None,
    }
}

pub fn job_return(jid: &Jid, id: &str, payload: serde_json::Value) -> JobReturn {
    JobReturn {
        jid: jid.clone(),
        minion_id: MinionId::from(id),
        fun: "test.ping".into(),
        success: true,
        payload,
        ended_at: Utc::now(),
    }
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Poll `check` until it holds or `wait` passes.
pub async fn eventually<F, Fut>(wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
