//! Key handshake.

use brine_transport::{AuthReply, AuthRequest, Response};
use tracing::{debug, error, warn};

use crate::keys::{Decision, KeyError};
use crate::metrics::record_auth;
use crate::server::MasterServer;

pub async fn authenticate(server: &MasterServer, req: AuthRequest) -> Response {
    let decision = match server
        .keys
        .request_key(&req.id, &req.public_key, &req.autosign_grains)
        .await
    {
        Ok(decision) => decision,
        Err(e @ (KeyError::InvalidId(_) | KeyError::MalformedKey(_))) => {
            warn!(minion_id = %req.id, error = %e, "refusing malformed auth request");
            record_auth("invalid");
            return Response::Error {
                message: e.to_string(),
            };
        }
        Err(e) => {
            error!(minion_id = %req.id, error = %e, "key lookup failed");
            record_auth("error");
            return Response::Error {
                message: "key store unavailable".into(),
            };
        }
    };
    record_auth(decision.as_str());

    let reply = match decision {
        Decision::Pending => AuthReply::Pending,
        Decision::Rejected => AuthReply::Rejected,
        Decision::Full => AuthReply::Full,
        Decision::Accepted => {
            let session = server.sessions.current();
            match server.identity.grant(&req.id, &req.public_key, &session) {
                Ok(grant) => {
                    debug!(minion_id = %req.id, version = session.version, "issued session key");
                    server.presence.touch(&req.id);
                    if req.syndic && server.config.order_masters {
                        debug!(minion_id = %req.id, "syndic authenticated");
                        server.syndics.insert(req.id.clone());
                    } else {
                        if req.syndic {
                            warn!(minion_id = %req.id, "syndic refused, order_masters is off");
                        }
                        server.syndics.remove(&req.id);
                    }
                    AuthReply::Accepted(grant)
                }
                Err(e) => {
                    error!(minion_id = %req.id, error = %e, "could not wrap session key");
                    return Response::Error {
                        message: "could not issue session key".into(),
                    };
                }
            }
        }
    };
    Response::Auth(reply)
}
