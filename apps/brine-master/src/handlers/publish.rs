use brine_transport::{PublishRequest, Response};
use tracing::{info, warn};

use crate::handlers::is_local;
use crate::memcache::MemCache;
use crate::publisher::{publish_job, PublishError};
use crate::server::MasterServer;

pub async fn submit(
    server: &MasterServer,
    cache: &mut MemCache,
    req: PublishRequest,
    peer: &str,
) -> Response {
    if !is_local(peer) {
        warn!(peer, "publish refused outside the local client channel");
        return Response::Error {
            message: "jobs are only accepted from the local client".into(),
        };
    }
    let root = server.is_root_token(req.token.as_deref());
    let user = req.user.clone();
    match publish_job(server, cache, req, root).await {
        Ok(reply) => Response::Published(reply),
        Err(e @ PublishError::Acl(_)) => {
            warn!(user = %user, error = %e, "publish denied");
            Response::Error {
                message: e.to_string(),
            }
        }
        Err(e) => {
            info!(user = %user, error = %e, "publish failed");
            Response::Error {
                message: e.to_string(),
            }
        }
    }
}
