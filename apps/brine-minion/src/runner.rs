//! Answers the jobs a master publishes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use brine_client::{LinkHandler, MasterLink};
use brine_config::MinionConfig;
use brine_storage::{Jid, Job, JobReturn, JobStore, MinionId, StoreError};
use brine_store_fs::FsJobStore;
use brine_targeting::{matches, MatchContext};
use brine_transport::{MinionReply, MinionRequest, PublishLoad};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::executor::{execute, ExecContext};

const JOB_CACHE_DIR: &str = "minion_jobs";

struct Inner {
    id: MinionId,
    grains: Value,
    saltenv: Option<String>,
    pillar: RwLock<Value>,
    running: DashMap<Jid, Job>,
    cache: Option<FsJobStore>,
}

/// Shared by every master link the minion holds.
#[derive(Clone)]
pub struct MinionRunner {
    inner: Arc<Inner>,
}

/// Configured grains plus the `id` grain.
pub fn minion_grains(config: &MinionConfig) -> Value {
    let mut grains: serde_json::Map<String, Value> = config
        .grains
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    grains.insert("id".into(), Value::String(config.minion_id().to_string()));
    Value::Object(grains)
}

impl MinionRunner {
    pub fn new(
        id: MinionId,
        grains: Value,
        saltenv: Option<String>,
        cache: Option<FsJobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                grains,
                saltenv,
                pillar: RwLock::new(Value::Object(Default::default())),
                running: DashMap::new(),
                cache,
            }),
        }
    }

    pub async fn from_config(config: &MinionConfig) -> Result<Self, StoreError> {
        let cache = if config.cache_jobs {
            Some(FsJobStore::open(config.cachedir.join(JOB_CACHE_DIR), config.hash_type).await?)
        } else {
            None
        };
        Ok(Self::new(
            MinionId::from(config.minion_id()),
            minion_grains(config),
            config.saltenv.clone(),
            cache,
        ))
    }

    pub fn grains(&self) -> &Value {
        &self.inner.grains
    }

    pub fn running(&self) -> usize {
        self.inner.running.len()
    }

    /// Masters publish to everyone; each minion decides for itself.
    pub fn targets_me(&self, job: &Job) -> bool {
        let nodegroups = BTreeMap::new();
        let ctx = MatchContext {
            id: self.inner.id.as_str(),
            grains: &self.inner.grains,
            nodegroups: &nodegroups,
        };
        match matches(&job.target, &ctx) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(jid = %job.jid, error = %e, "unusable target");
                false
            }
        }
    }

    async fn cache_job(&self, job: &Job) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let saved = match cache.reserve_jid(&job.jid, job.origin.as_deref()).await {
            Ok(()) | Err(StoreError::AlreadyExists) => cache.save_job(job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(jid = %job.jid, error = %e, "could not cache job");
        }
    }

    async fn cache_return(&self, ret: &JobReturn) {
        if let Some(cache) = &self.inner.cache {
            if let Err(e) = cache.save_return(ret).await {
                warn!(jid = %ret.jid, error = %e, "could not cache return");
            }
        }
    }

    /// Run a published job if it targets this minion. `None` when it does
    /// not, or when the same JID is already running.
    pub async fn handle_job(&self, job: Job) -> Option<JobReturn> {
        if !self.targets_me(&job) {
            debug!(jid = %job.jid, "job not for us");
            return None;
        }
        if self.inner.running.insert(job.jid.clone(), job.clone()).is_some() {
            debug!(jid = %job.jid, "job already running");
            return None;
        }
        info!(jid = %job.jid, fun = %job.fun, "running job");
        self.cache_job(&job).await;

        let pillar = self.inner.pillar.read().await.clone();
        let running: Vec<Job> = self
            .inner
            .running
            .iter()
            .filter(|entry| entry.key() != &job.jid)
            .map(|entry| entry.value().clone())
            .collect();
        let ctx = ExecContext {
            grains: &self.inner.grains,
            pillar: &pillar,
            running: &running,
        };
        let result = execute(&ctx, &job.fun, &job.args).await;
        self.inner.running.remove(&job.jid);

        let (success, payload) = match result {
            Ok(value) => (true, value),
            Err(e) => {
                warn!(jid = %job.jid, fun = %job.fun, error = %e, "job failed");
                (false, Value::String(e.to_string()))
            }
        };
        let ret = JobReturn {
            jid: job.jid,
            minion_id: self.inner.id.clone(),
            fun: job.fun,
            success,
            payload,
            ended_at: Utc::now(),
        };
        self.cache_return(&ret).await;
        Some(ret)
    }

    async fn refresh_pillar(&self, link: &MasterLink) {
        let request = MinionRequest::Pillar {
            saltenv: self.inner.saltenv.clone(),
        };
        match link.request(&request).await {
            Ok(MinionReply::Pillar { data }) => {
                debug!(master = %link.master(), "pillar refreshed");
                *self.inner.pillar.write().await = data;
            }
            Ok(other) => warn!(master = %link.master(), reply = ?other, "unexpected pillar reply"),
            Err(e) => warn!(master = %link.master(), error = %e, "pillar refresh failed"),
        }
    }
}

#[async_trait]
impl LinkHandler for MinionRunner {
    async fn connected(&self, link: Arc<MasterLink>) {
        info!(master = %link.master(), "connected to master");
        let upload = MinionRequest::Grains {
            grains: self.inner.grains.clone(),
        };
        if let Err(e) = link.request(&upload).await {
            warn!(master = %link.master(), error = %e, "grains upload failed");
        }
        self.refresh_pillar(&link).await;
    }

    async fn publish(&self, link: Arc<MasterLink>, load: PublishLoad) {
        let runner = self.clone();
        tokio::spawn(async move {
            let Some(ret) = runner.handle_job(load.job).await else {
                return;
            };
            let jid = ret.jid.clone();
            match link.request(&MinionRequest::Return(ret)).await {
                Ok(MinionReply::Ack) => debug!(%jid, "return delivered"),
                Ok(other) => warn!(%jid, reply = ?other, "return not acknowledged"),
                Err(e) => warn!(%jid, error = %e, "could not deliver return"),
            }
        });
    }

    async fn disconnected(&self, master: &str) {
        info!(%master, running = self.running(), "disconnected from master");
    }
}
