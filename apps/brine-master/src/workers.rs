//! The worker pool.
//!
//! `worker_threads` tasks pull from one queue fed by every transport. Each
//! worker owns its memcache; nothing else is per-worker.

use std::sync::Arc;

use brine_transport::{Incoming, Response};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::handlers;
use crate::memcache::MemCache;
use crate::metrics::RequestTimer;
use crate::server::MasterServer;

pub fn spawn_workers(
    server: MasterServer,
    queue: mpsc::Receiver<Incoming>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..server.config.worker_threads)
        .map(|n| {
            tokio::spawn(worker(
                n,
                server.clone(),
                queue.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn next(queue: &Mutex<mpsc::Receiver<Incoming>>) -> Option<Incoming> {
    queue.lock().await.recv().await
}

async fn worker(
    n: usize,
    server: MasterServer,
    queue: Arc<Mutex<mpsc::Receiver<Incoming>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cache = MemCache::from_config(server.store.clone(), &server.config);
    debug!(worker = n, "worker started");
    loop {
        let incoming = tokio::select! {
            incoming = next(&queue) => incoming,
            _ = shutdown.changed() => None,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let timer = RequestTimer::new(handlers::kind(&incoming.request));
        let response =
            handlers::dispatch(&server, &mut cache, incoming.request, &incoming.peer).await;
        timer.finish(if matches!(response, Response::Error { .. }) {
            "error"
        } else {
            "ok"
        });
        if incoming.reply.send(response).is_err() {
            debug!(worker = n, peer = %incoming.peer, "requester went away");
        }
    }
    debug!(worker = n, "worker stopped");
}
