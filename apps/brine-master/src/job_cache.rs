//! Job metadata and returns on top of the configured [`JobStore`].
//!
//! JIDs are reserved in the store even when `job_cache` is off, so a JID is
//! never handed out twice inside the retention window.

use std::time::Duration;

use brine_config::MasterConfig;
use brine_storage::{Jid, Job, JobReturn, JobStore, MinionId, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::StoreBackend;
use crate::jid::gen_jid;

const JID_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum JobCacheError {
    #[error("jid {0} is already used by another job")]
    Collision(Jid),
    #[error("no free jid after {0} attempts")]
    Exhausted(usize),
    #[error("job {0} not found")]
    NotFound(Jid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobCache {
    store: StoreBackend,
    enabled: bool,
    unique_jid: bool,
}

impl JobCache {
    pub fn new(store: StoreBackend, config: &MasterConfig) -> Self {
        Self {
            store,
            enabled: config.job_cache,
            unique_jid: config.unique_jid,
        }
    }

    /// Reserve a JID. A passed JID (relayed from an upper master) is kept
    /// as is unless a reservation from a different origin already holds it.
    pub async fn prep_jid(
        &self,
        passed: Option<&Jid>,
        origin: Option<&str>,
    ) -> Result<Jid, JobCacheError> {
        if let Some(jid) = passed {
            return match self.store.reserve_jid(jid, origin).await {
                Ok(()) => Ok(jid.clone()),
                Err(StoreError::AlreadyExists) => match self.store.jid_origin(jid).await {
                    Ok(held) if held.as_deref() == origin => {
                        debug!(%jid, "reusing relayed jid");
                        Ok(jid.clone())
                    }
                    // Another origin, or a reservation with no readable origin.
                    Ok(_) | Err(StoreError::NotFound) => {
                        warn!(%jid, origin = ?origin, "passed jid already held");
                        Err(JobCacheError::Collision(jid.clone()))
                    }
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            };
        }

        for attempt in 1..=JID_ATTEMPTS {
            let jid = gen_jid(self.unique_jid);
            match self.store.reserve_jid(&jid, None).await {
                Ok(()) => return Ok(jid),
                Err(StoreError::AlreadyExists) => {
                    debug!(%jid, attempt, "jid collision, retrying");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(JobCacheError::Exhausted(JID_ATTEMPTS))
    }

    /// Persist the job load. Failures are logged, never fatal to the job.
    pub async fn save_load(&self, job: &Job) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.store.save_job(job).await {
            warn!(jid = %job.jid, error = %e, "failed to cache job load");
        }
    }

    pub async fn add_minions(&self, jid: &Jid, minions: &[MinionId]) {
        if !self.enabled || minions.is_empty() {
            return;
        }
        if let Err(e) = self.store.add_minions(jid, minions).await {
            warn!(%jid, error = %e, "failed to cache expected minions");
        }
    }

    /// Store a return. Returns `false` when it was not recorded.
    pub async fn save_return(&self, ret: &JobReturn) -> bool {
        if !self.enabled {
            return false;
        }
        match self.store.save_return(ret).await {
            Ok(()) => true,
            Err(StoreError::Conflict) => {
                debug!(jid = %ret.jid, minion_id = %ret.minion_id, "duplicate return ignored");
                false
            }
            Err(e) => {
                warn!(jid = %ret.jid, minion_id = %ret.minion_id, error = %e, "failed to cache return");
                false
            }
        }
    }

    pub async fn get_job(&self, jid: &Jid) -> Result<Job, JobCacheError> {
        self.store.get_job(jid).await.map_err(|e| match e {
            StoreError::NotFound => JobCacheError::NotFound(jid.clone()),
            other => other.into(),
        })
    }

    pub async fn expected_minions(&self, jid: &Jid) -> Result<Vec<MinionId>, JobCacheError> {
        match self.store.get_minions(jid).await {
            Ok(minions) => Ok(minions),
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_returns(&self, jid: &Jid) -> Result<Vec<JobReturn>, JobCacheError> {
        match self.store.get_returns(jid).await {
            Ok(mut returns) => {
                returns.sort_by(|a, b| a.minion_id.cmp(&b.minion_id));
                Ok(returns)
            }
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cached jobs, oldest first. Reservations without a load are skipped.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, JobCacheError> {
        let mut jobs = Vec::new();
        for jid in self.store.list_jids().await? {
            match self.store.get_job(&jid).await {
                Ok(job) => jobs.push(job),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(jobs)
    }

    /// Drop jobs older than `keep_jobs_seconds`. Zero keeps everything.
    pub async fn clean_old_jobs(&self, keep_jobs_seconds: u64) -> Result<usize, JobCacheError> {
        if keep_jobs_seconds == 0 {
            return Ok(0);
        }
        let keep = chrono::Duration::seconds(i64::try_from(keep_jobs_seconds).unwrap_or(i64::MAX));
        let cutoff = Utc::now()
            .checked_sub_signed(keep)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let removed = self.store.clean_old_jobs(cutoff).await?;
        if removed > 0 {
            info!(removed, "purged old jobs");
        }
        Ok(removed)
    }
}
