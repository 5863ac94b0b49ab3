//! Sealed traffic from authenticated minions.
//!
//! A request sealed under an older session version, or from an id whose
//! key is no longer accepted, is answered with `Reauth`.

use brine_storage::MinionId;
use brine_transport::secure::{open, seal};
use brine_transport::{MinionReply, MinionRequest, Response, SealedMessage};
use tracing::{debug, error, warn};

use crate::memcache::MemCache;
use crate::metrics::record_return;
use crate::publisher::GRAINS_BANK;
use crate::server::MasterServer;

/// Cache bank holding the last compiled pillar per minion.
pub const PILLAR_BANK: &str = "pillar";

pub async fn handle_sealed(
    server: &MasterServer,
    cache: &mut MemCache,
    sealed: SealedMessage,
) -> Response {
    match server.keys.accepted_key(&sealed.id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            debug!(minion_id = %sealed.id, "sealed request from a minion without an accepted key");
            return Response::Reauth;
        }
        Err(e) => {
            error!(minion_id = %sealed.id, error = %e, "key lookup failed");
            return Response::Error {
                message: "key store unavailable".into(),
            };
        }
    }

    let session = server.sessions.current();
    if sealed.session_version != session.version {
        debug!(
            minion_id = %sealed.id,
            presented = sealed.session_version,
            current = session.version,
            "stale session"
        );
        return Response::Reauth;
    }
    let request: MinionRequest = match open(&session.key, &sealed) {
        Ok(request) => request,
        Err(e) => {
            warn!(minion_id = %sealed.id, error = %e, "could not open sealed request");
            return Response::Error {
                message: "could not open request".into(),
            };
        }
    };

    server.presence.touch(&sealed.id);
    let reply = handle(server, cache, &sealed.id, request).await;

    match seal(&session.key, session.version, &sealed.id, &reply) {
        Ok(sealed_reply) => Response::Secure(sealed_reply),
        Err(e) => {
            error!(minion_id = %sealed.id, error = %e, "could not seal reply");
            Response::Error {
                message: "could not seal reply".into(),
            }
        }
    }
}

fn failed(message: impl Into<String>) -> MinionReply {
    MinionReply::Error {
        message: message.into(),
    }
}

async fn handle(
    server: &MasterServer,
    cache: &mut MemCache,
    id: &MinionId,
    request: MinionRequest,
) -> MinionReply {
    if matches!(
        request,
        MinionRequest::SyndicReturn { .. } | MinionRequest::SyndicMinions { .. }
    ) && !server.syndics.contains(id)
    {
        warn!(minion_id = %id, "syndic request from a plain minion refused");
        return failed("only syndics may relay");
    }
    match request {
        MinionRequest::Return(ret) => {
            if &ret.minion_id != id {
                warn!(minion_id = %id, claimed = %ret.minion_id, "return for another minion refused");
                return failed("returns may only be sent for yourself");
            }
            debug!(jid = %ret.jid, minion_id = %id, fun = %ret.fun, "return received");
            server.jobs.save_return(&ret).await;
            record_return("minion");
            let _ = server.returns.send(ret);
            MinionReply::Ack
        }
        MinionRequest::SyndicReturn { returns } => {
            debug!(syndic = %id, count = returns.len(), "returns relayed by syndic");
            for ret in returns {
                server.jobs.save_return(&ret).await;
                record_return("syndic");
                let _ = server.returns.send(ret);
            }
            MinionReply::Ack
        }
        MinionRequest::SyndicMinions { jid, minions } => {
            debug!(syndic = %id, %jid, count = minions.len(), "syndic expects returns");
            server.jobs.add_minions(&jid, &minions).await;
            MinionReply::Ack
        }
        MinionRequest::Grains { grains } => match cache.store(GRAINS_BANK, id.as_str(), &grains).await {
            Ok(()) => MinionReply::Ack,
            Err(e) => {
                warn!(minion_id = %id, error = %e, "could not cache grains");
                failed("could not store grains")
            }
        },
        MinionRequest::Pillar { saltenv } => {
            let grains = match cache.fetch(GRAINS_BANK, id.as_str()).await {
                Ok(grains) => grains.unwrap_or(serde_json::Value::Null),
                Err(e) => {
                    warn!(minion_id = %id, error = %e, "grains unavailable for pillar");
                    serde_json::Value::Null
                }
            };
            let data = server
                .pillar
                .compile(id.as_str(), &grains, saltenv.as_deref())
                .await;
            if let Err(e) = cache.store(PILLAR_BANK, id.as_str(), &data).await {
                warn!(minion_id = %id, error = %e, "could not cache pillar");
            }
            MinionReply::Pillar { data }
        }
        MinionRequest::FileList { saltenv } => match server.fileserver.file_list(&saltenv).await {
            Ok(files) => MinionReply::FileList { files },
            Err(e) => {
                warn!(minion_id = %id, env = %saltenv, error = %e, "file list failed");
                failed(e.to_string())
            }
        },
        MinionRequest::FileFetch { saltenv, path } => {
            match server.fileserver.find_file(&saltenv, &path).await {
                Ok(Some(entry)) => MinionReply::File {
                    data: entry.data,
                    hash: entry.hash,
                },
                Ok(None) => failed(format!("{path} not found in {saltenv}")),
                Err(e) => {
                    warn!(minion_id = %id, env = %saltenv, path = %path, error = %e, "file fetch failed");
                    failed(e.to_string())
                }
            }
        }
    }
}
