//! Target resolution and job publication.

use brine_storage::{Job, KeyStore, MinionId, StoreError, Target, TargetKind};
use brine_targeting::{expand_nodegroups, matches, MatchContext, TargetError};
use brine_transport::secure::{seal_publish, SealError};
use brine_transport::{PublishLoad, PublishReply, PublishRequest};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acl::AclError;
use crate::job_cache::JobCacheError;
use crate::memcache::MemCache;
use crate::metrics::record_publish;
use crate::server::MasterServer;

/// Cache bank holding the last grains each minion uploaded.
pub const GRAINS_BANK: &str = "grains";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("no minions matched the target")]
    NoMinions,
    #[error(transparent)]
    Jid(#[from] JobCacheError),
    #[error("could not seal publish: {0}")]
    Seal(#[from] SealError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PublishError {
    fn outcome(&self) -> &'static str {
        match self {
            PublishError::Acl(_) => "denied",
            PublishError::Target(_) => "bad_target",
            PublishError::NoMinions => "no_minions",
            _ => "error",
        }
    }
}

fn needs_grains(target: &Target) -> bool {
    matches!(
        target.kind,
        TargetKind::Grain | TargetKind::Compound | TargetKind::Nodegroup
    )
}

/// Accepted minions matching `target`.
pub async fn resolve_target(
    server: &MasterServer,
    cache: &mut MemCache,
    target: &Target,
) -> Result<Vec<MinionId>, PublishError> {
    let listing = server.store.list_keys().await?;
    let with_grains = needs_grains(target);
    let mut matched = Vec::new();
    for id in listing.accepted {
        let grains = if with_grains {
            cache
                .fetch(GRAINS_BANK, id.as_str())
                .await?
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        let ctx = MatchContext {
            id: id.as_str(),
            grains: &grains,
            nodegroups: &server.config.nodegroups,
        };
        if matches(target, &ctx)? {
            matched.push(id);
        }
    }
    matched.sort();
    Ok(matched)
}

/// Authorize, resolve, allocate a JID, cache the load, then seal the job
/// under the current session key and broadcast it on every transport.
pub async fn publish_job(
    server: &MasterServer,
    cache: &mut MemCache,
    req: PublishRequest,
    root: bool,
) -> Result<PublishReply, PublishError> {
    let result = publish_inner(server, cache, req, root).await;
    match &result {
        Ok(_) => record_publish("ok"),
        Err(e) => record_publish(e.outcome()),
    }
    result
}

async fn publish_inner(
    server: &MasterServer,
    cache: &mut MemCache,
    req: PublishRequest,
    root: bool,
) -> Result<PublishReply, PublishError> {
    server.acl.authorize(&req.user, root, &req.fun)?;

    let target = expand_nodegroups(&req.target, &server.config.nodegroups)?;
    let minions = resolve_target(server, cache, &target).await?;
    if minions.is_empty() {
        if !server.config.order_masters {
            return Err(PublishError::NoMinions);
        }
        debug!(target = %target.expr, "no local match, publishing for lower masters");
    }

    let jid = server
        .jobs
        .prep_jid(req.jid.as_ref(), req.origin.as_deref())
        .await?;
    let job = Job {
        jid: jid.clone(),
        target,
        fun: req.fun,
        args: req.args,
        user: req.user,
        origin: req.origin,
        created_at: Utc::now(),
    };
    server.jobs.save_load(&job).await;
    server.jobs.add_minions(&jid, &minions).await;

    // One snapshot of the key for every transport.
    let session = server.sessions.current();
    let frame = seal_publish(&session.key, session.version, &PublishLoad { job: job.clone() })?;
    for transport in server.transports.iter() {
        if let Err(e) = transport.publish(frame.clone()).await {
            warn!(%jid, transport = transport.kind(), error = %e, "publish failed on transport");
        }
    }

    info!(
        %jid,
        fun = %job.fun,
        user = %job.user,
        minions = minions.len(),
        session_version = session.version,
        "published job"
    );
    Ok(PublishReply { jid, minions })
}
