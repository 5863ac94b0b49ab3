//! Key administration over the local client channel.

use brine_targeting::expr_match;
use brine_transport::{AdminReply, AdminRequest, KeyAction, Response};
use tracing::warn;

use crate::handlers::is_local;
use crate::keys::KeyError;
use crate::server::MasterServer;

/// Name the master's own key is listed under by `finger`.
pub const MASTER_PUB: &str = "master.pub";

pub async fn key_admin(server: &MasterServer, req: AdminRequest, peer: &str) -> Response {
    if !is_local(peer) {
        warn!(peer, "key administration refused outside the local client channel");
        return Response::Error {
            message: "key administration is only accepted from the local client".into(),
        };
    }
    if !server.is_root_token(Some(&req.token)) {
        warn!(peer, "key administration with a bad token");
        return Response::Error {
            message: "invalid token".into(),
        };
    }
    match run(server, req.action).await {
        Ok(reply) => Response::Admin(reply),
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    }
}

async fn run(server: &MasterServer, action: KeyAction) -> Result<AdminReply, KeyError> {
    Ok(match action {
        KeyAction::List => AdminReply::Keys(server.keys.list_keys().await?),
        KeyAction::Accept {
            pattern,
            include_rejected,
        } => AdminReply::Changed {
            ids: server.keys.accept(&pattern, include_rejected).await?,
        },
        KeyAction::Reject {
            pattern,
            include_accepted,
        } => AdminReply::Changed {
            ids: server.keys.reject(&pattern, include_accepted).await?,
        },
        KeyAction::Delete { pattern } => AdminReply::Changed {
            ids: server.keys.delete(&pattern).await?,
        },
        KeyAction::Finger { pattern } => {
            let mut fingers = server.keys.finger(&pattern).await?;
            if expr_match(MASTER_PUB, &pattern) {
                fingers.insert(MASTER_PUB.to_string(), server.identity.fingerprint());
            }
            AdminReply::Fingers { fingers }
        }
    })
}
