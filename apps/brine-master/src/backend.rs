use std::sync::Arc;

use async_trait::async_trait;
use brine_config::{MasterConfig, StoreKind};
use brine_storage::{
    DataCache, Jid, Job, JobReturn, JobStore, KeyListing, KeyRecord, KeyStore, MinionId,
    StoreError,
};
use brine_store_fs::{FsDataCache, FsJobStore, FsKeyStore};
use brine_store_memory::MemoryStore;
use chrono::{DateTime, Utc};

/// The three filesystem stores a master keeps under `pki_dir` and `cachedir`.
pub struct FsStores {
    pub keys: FsKeyStore,
    pub jobs: FsJobStore,
    pub cache: FsDataCache,
}

impl FsStores {
    pub async fn open(config: &MasterConfig) -> Result<Self, StoreError> {
        Ok(Self {
            keys: FsKeyStore::open(&config.pki_dir).await?,
            jobs: FsJobStore::open(&config.cachedir, config.hash_type).await?,
            cache: FsDataCache::new(config.cachedir.join("minions")),
        })
    }
}

/// Store backend wrapper that delegates to the configured implementation.
#[derive(Clone)]
pub enum StoreBackend {
    Fs(Arc<FsStores>),
    Memory(Arc<MemoryStore>),
}

impl StoreBackend {
    pub async fn from_config(config: &MasterConfig) -> Result<Self, StoreError> {
        Ok(match config.cache {
            StoreKind::Fs => StoreBackend::Fs(Arc::new(FsStores::open(config).await?)),
            StoreKind::Memory => StoreBackend::Memory(Arc::new(MemoryStore::new())),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Fs(_) => "fs",
            StoreBackend::Memory(_) => "memory",
        }
    }
}

// ───────────────────────────────────── Keys ───────────────────────────────────────────

#[async_trait]
impl KeyStore for StoreBackend {
    async fn get_key(&self, id: &MinionId) -> Result<KeyRecord, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.keys.get_key(id).await,
            StoreBackend::Memory(s) => s.get_key(id).await,
        }
    }

    async fn put_key(&self, record: &KeyRecord) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.keys.put_key(record).await,
            StoreBackend::Memory(s) => s.put_key(record).await,
        }
    }

    async fn delete_key(&self, id: &MinionId) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.keys.delete_key(id).await,
            StoreBackend::Memory(s) => s.delete_key(id).await,
        }
    }

    async fn list_keys(&self) -> Result<KeyListing, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.keys.list_keys().await,
            StoreBackend::Memory(s) => s.list_keys().await,
        }
    }

    async fn record_denied(&self, id: &MinionId, public_key: &[u8]) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.keys.record_denied(id, public_key).await,
            StoreBackend::Memory(s) => s.record_denied(id, public_key).await,
        }
    }
}

// ───────────────────────────────────── Jobs ───────────────────────────────────────────

#[async_trait]
impl JobStore for StoreBackend {
    async fn reserve_jid(&self, jid: &Jid, origin: Option<&str>) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.reserve_jid(jid, origin).await,
            StoreBackend::Memory(s) => s.reserve_jid(jid, origin).await,
        }
    }

    async fn jid_origin(&self, jid: &Jid) -> Result<Option<String>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.jid_origin(jid).await,
            StoreBackend::Memory(s) => s.jid_origin(jid).await,
        }
    }

    async fn list_jids(&self) -> Result<Vec<Jid>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.list_jids().await,
            StoreBackend::Memory(s) => s.list_jids().await,
        }
    }

    async fn clean_old_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.clean_old_jobs(cutoff).await,
            StoreBackend::Memory(s) => s.clean_old_jobs(cutoff).await,
        }
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.save_job(job).await,
            StoreBackend::Memory(s) => s.save_job(job).await,
        }
    }

    async fn get_job(&self, jid: &Jid) -> Result<Job, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.get_job(jid).await,
            StoreBackend::Memory(s) => s.get_job(jid).await,
        }
    }

    async fn add_minions(&self, jid: &Jid, minions: &[MinionId]) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.add_minions(jid, minions).await,
            StoreBackend::Memory(s) => s.add_minions(jid, minions).await,
        }
    }

    async fn get_minions(&self, jid: &Jid) -> Result<Vec<MinionId>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.get_minions(jid).await,
            StoreBackend::Memory(s) => s.get_minions(jid).await,
        }
    }

    async fn save_return(&self, ret: &JobReturn) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.save_return(ret).await,
            StoreBackend::Memory(s) => s.save_return(ret).await,
        }
    }

    async fn get_returns(&self, jid: &Jid) -> Result<Vec<JobReturn>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.jobs.get_returns(jid).await,
            StoreBackend::Memory(s) => s.get_returns(jid).await,
        }
    }
}

// ───────────────────────────────────── Cache ──────────────────────────────────────────

#[async_trait]
impl DataCache for StoreBackend {
    async fn fetch(&self, bank: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.cache.fetch(bank, key).await,
            StoreBackend::Memory(s) => s.fetch(bank, key).await,
        }
    }

    async fn store(
        &self,
        bank: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.cache.store(bank, key, data).await,
            StoreBackend::Memory(s) => s.store(bank, key, data).await,
        }
    }

    async fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), StoreError> {
        match self {
            StoreBackend::Fs(s) => s.cache.flush(bank, key).await,
            StoreBackend::Memory(s) => s.flush(bank, key).await,
        }
    }

    async fn list(&self, bank: &str) -> Result<Vec<String>, StoreError> {
        match self {
            StoreBackend::Fs(s) => s.cache.list(bank).await,
            StoreBackend::Memory(s) => s.list(bank).await,
        }
    }
}
