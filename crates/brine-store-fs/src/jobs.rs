use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brine_crypto::HashType;
use brine_storage::{Jid, Job, JobReturn, JobStore, MinionId, StoreError};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::write_atomic;

const JID_FILE: &str = "jid";
const LOAD_FILE: &str = "load.json";
const MINIONS_FILE: &str = "minions.json";
const RETURN_FILE: &str = "return.json";

/// Local job cache: `<root>/<hash[..2]>/<hash[2..]>/` per JID.
pub struct FsJobStore {
    root: PathBuf,
    hash_type: HashType,
    // Serializes read-modify-write of minions.json.
    minions_lock: Mutex<()>,
}

impl FsJobStore {
    /// Open the job cache rooted at `<cachedir>/jobs`.
    pub async fn open(cachedir: impl AsRef<Path>, hash_type: HashType) -> Result<Self, StoreError> {
        let root = cachedir.as_ref().join("jobs");
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            hash_type,
            minions_lock: Mutex::new(()),
        })
    }

    /// Directory holding everything for one JID.
    pub fn job_dir(&self, jid: &Jid) -> PathBuf {
        let hash = self.hash_type.digest_hex(jid.0.as_bytes());
        let (head, tail) = hash.split_at(2);
        self.root.join(head).join(tail)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every job directory paired with its reservation time.
    async fn job_dirs(&self) -> Result<Vec<(DateTime<Utc>, PathBuf)>, StoreError> {
        let mut out = Vec::new();
        let mut top = tokio::fs::read_dir(&self.root).await?;
        while let Some(bucket) = top.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(bucket.path()).await?;
            while let Some(job) = inner.next_entry().await? {
                let jid_path = job.path().join(JID_FILE);
                let modified = match tokio::fs::metadata(&jid_path).await {
                    Ok(meta) => meta.modified().map(DateTime::<Utc>::from)?,
                    // Half-written reservation; judge by the directory itself.
                    Err(_) => job.metadata().await?.modified().map(DateTime::<Utc>::from)?,
                };
                out.push((modified, job.path()));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn reserve_jid(&self, jid: &Jid, origin: Option<&str>) -> Result<(), StoreError> {
        let dir = self.job_dir(jid);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // create_dir is the atomic existence check.
        tokio::fs::create_dir(&dir).await?;
        // `<jid>\n<origin>`, the second line empty for local JIDs.
        let contents = format!("{}\n{}", jid.0, origin.unwrap_or_default());
        tokio::fs::write(dir.join(JID_FILE), contents).await?;
        Ok(())
    }

    async fn jid_origin(&self, jid: &Jid) -> Result<Option<String>, StoreError> {
        let contents = tokio::fs::read_to_string(self.job_dir(jid).join(JID_FILE)).await?;
        Ok(contents
            .lines()
            .nth(1)
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string))
    }

    async fn list_jids(&self) -> Result<Vec<Jid>, StoreError> {
        let mut dirs = self.job_dirs().await?;
        dirs.sort();
        let mut jids = Vec::with_capacity(dirs.len());
        for (_, dir) in dirs {
            match tokio::fs::read_to_string(dir.join(JID_FILE)).await {
                Ok(contents) => {
                    let jid = contents.lines().next().unwrap_or_default().trim();
                    jids.push(Jid(jid.to_string()));
                }
                Err(e) => debug!("Skipping job dir {} without jid: {}", dir.display(), e),
            }
        }
        Ok(jids)
    }

    async fn clean_old_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (modified, dir) in self.job_dirs().await? {
            if modified < cutoff {
                tokio::fs::remove_dir_all(&dir).await?;
                removed += 1;
                if let Some(parent) = dir.parent() {
                    // Only succeeds once the bucket is empty.
                    let _ = tokio::fs::remove_dir(parent).await;
                }
            }
        }
        Ok(removed)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let dir = self.job_dir(&job.jid);
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(LOAD_FILE), &serde_json::to_vec(job)?).await
    }

    async fn get_job(&self, jid: &Jid) -> Result<Job, StoreError> {
        Self::read_json(&self.job_dir(jid).join(LOAD_FILE)).await
    }

    async fn add_minions(&self, jid: &Jid, minions: &[MinionId]) -> Result<(), StoreError> {
        let dir = self.job_dir(jid);
        let path = dir.join(MINIONS_FILE);
        let _guard = self.minions_lock.lock().await;
        let mut merged: BTreeSet<MinionId> = match Self::read_json::<Vec<MinionId>>(&path).await {
            Ok(existing) => existing.into_iter().collect(),
            Err(StoreError::NotFound) => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        merged.extend(minions.iter().cloned());
        tokio::fs::create_dir_all(&dir).await?;
        let list: Vec<&MinionId> = merged.iter().collect();
        write_atomic(&path, &serde_json::to_vec(&list)?).await
    }

    async fn get_minions(&self, jid: &Jid) -> Result<Vec<MinionId>, StoreError> {
        let dir = self.job_dir(jid);
        match Self::read_json(&dir.join(MINIONS_FILE)).await {
            Err(StoreError::NotFound) if tokio::fs::metadata(&dir).await.is_ok() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn save_return(&self, ret: &JobReturn) -> Result<(), StoreError> {
        if !ret.minion_id.is_valid() {
            return Err(StoreError::Backend(format!(
                "invalid minion id {:?}",
                ret.minion_id.0
            )));
        }
        let dir = self.job_dir(&ret.jid).join(&ret.minion_id.0);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict)
            }
            Err(e) => return Err(e.into()),
        }
        write_atomic(&dir.join(RETURN_FILE), &serde_json::to_vec(ret)?).await
    }

    async fn get_returns(&self, jid: &Jid) -> Result<Vec<JobReturn>, StoreError> {
        let dir = self.job_dir(jid);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut returns = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::read_json::<JobReturn>(&entry.path().join(RETURN_FILE)).await {
                Ok(ret) => returns.push(ret),
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        returns.sort_by(|a, b| a.minion_id.cmp(&b.minion_id));
        Ok(returns)
    }
}
