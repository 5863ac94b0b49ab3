//! Request handlers run by the worker pool.
//!
//! - auth: key handshake and session grants
//! - minion: sealed traffic from authenticated minions and syndics
//! - publish: job submission from the local client channel
//! - admin: key administration from the local client channel

pub mod admin;
pub mod auth;
pub mod minion;
pub mod publish;

use brine_transport::{Request, Response};

use crate::memcache::MemCache;
use crate::server::MasterServer;

/// Metrics label for a request.
pub fn kind(request: &Request) -> &'static str {
    match request {
        Request::Auth(_) => "auth",
        Request::Secure(_) => "secure",
        Request::Publish(_) => "publish",
        Request::Ping => "ping",
        Request::Admin(_) => "admin",
    }
}

/// Whether the request arrived over the local client channel.
pub fn is_local(peer: &str) -> bool {
    peer == "ipc" || peer.starts_with("ipc:")
}

pub async fn dispatch(
    server: &MasterServer,
    cache: &mut MemCache,
    request: Request,
    peer: &str,
) -> Response {
    match request {
        Request::Auth(req) => auth::authenticate(server, req).await,
        Request::Secure(sealed) => minion::handle_sealed(server, cache, sealed).await,
        Request::Publish(req) => publish::submit(server, cache, req, peer).await,
        Request::Ping => Response::Pong,
        Request::Admin(req) => admin::key_admin(server, req, peer).await,
    }
}
