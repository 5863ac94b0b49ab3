//! File serving to minions.
//!
//! A [`Fileserver`] fans out over the configured backends. Environment names
//! pass through the saltenv whitelist/blacklist before any backend is asked.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use brine_crypto::HashType;
use brine_targeting::check_whitelist_blacklist;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::PillarError;

/// A fetched file and its digest under the master's hash type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub data: Vec<u8>,
    pub hash: String,
}

#[async_trait]
pub trait FileserverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_environments(&self) -> Result<Vec<String>, PillarError>;

    /// Relative, `/`-separated paths of every file in `env`.
    async fn list_files(&self, env: &str) -> Result<Vec<String>, PillarError>;

    async fn fetch_file(&self, env: &str, path: &str) -> Result<Option<FileEntry>, PillarError>;

    /// Refresh whatever the backend caches between requests.
    async fn update(&self) -> Result<(), PillarError>;
}

/// Reject absolute paths and any `..` component.
pub fn relative_path(path: &str) -> Result<PathBuf, PillarError> {
    let candidate = Path::new(path);
    let clean = !path.is_empty()
        && !path.contains('\\')
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !clean {
        return Err(PillarError::InvalidPath(path.to_string()));
    }
    Ok(candidate.to_path_buf())
}

/// Every regular file under `root`, relative to it, sorted.
pub(crate) async fn walk_files(root: &Path) -> Result<Vec<String>, PillarError> {
    let mut out = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(root.join(&rel)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let child = rel.join(entry.file_name());
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(child);
            } else if kind.is_file() {
                let parts: Vec<String> = child
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(parts.join("/"));
            }
        }
    }
    out.sort();
    Ok(out)
}

// ───────────────────────────── roots ─────────────────────────────

/// Plain directories per environment (`file_roots`). Earlier roots shadow
/// later ones for the same relative path.
pub struct RootsBackend {
    roots: BTreeMap<String, Vec<PathBuf>>,
    hash_type: HashType,
    listing: RwLock<BTreeMap<String, Vec<String>>>,
}

impl RootsBackend {
    pub fn new(roots: BTreeMap<String, Vec<PathBuf>>, hash_type: HashType) -> Self {
        Self {
            roots,
            hash_type,
            listing: RwLock::new(BTreeMap::new()),
        }
    }

    async fn scan(&self, env: &str) -> Result<Vec<String>, PillarError> {
        let mut files = BTreeSet::new();
        for root in self.roots.get(env).into_iter().flatten() {
            files.extend(walk_files(root).await?);
        }
        Ok(files.into_iter().collect())
    }
}

#[async_trait]
impl FileserverBackend for RootsBackend {
    fn name(&self) -> &'static str {
        "roots"
    }

    async fn list_environments(&self) -> Result<Vec<String>, PillarError> {
        Ok(self.roots.keys().cloned().collect())
    }

    async fn list_files(&self, env: &str) -> Result<Vec<String>, PillarError> {
        if let Some(files) = self.listing.read().await.get(env) {
            return Ok(files.clone());
        }
        let files = self.scan(env).await?;
        self.listing
            .write()
            .await
            .insert(env.to_string(), files.clone());
        Ok(files)
    }

    async fn fetch_file(&self, env: &str, path: &str) -> Result<Option<FileEntry>, PillarError> {
        let rel = relative_path(path)?;
        for root in self.roots.get(env).into_iter().flatten() {
            match tokio::fs::read(root.join(&rel)).await {
                Ok(data) => {
                    let hash = self.hash_type.digest_hex(&data);
                    return Ok(Some(FileEntry { data, hash }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn update(&self) -> Result<(), PillarError> {
        let mut fresh = BTreeMap::new();
        for env in self.roots.keys() {
            fresh.insert(env.clone(), self.scan(env).await?);
        }
        *self.listing.write().await = fresh;
        Ok(())
    }
}

// ───────────────────────────── facade ─────────────────────────────

pub struct Fileserver {
    backends: Vec<Arc<dyn FileserverBackend>>,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl Fileserver {
    pub fn new(
        backends: Vec<Arc<dyn FileserverBackend>>,
        whitelist: Vec<String>,
        blacklist: Vec<String>,
    ) -> Self {
        Self {
            backends,
            whitelist,
            blacklist,
        }
    }

    /// Build the backends named by `fileserver_backend`.
    pub fn from_config(config: &brine_config::MasterConfig) -> Result<Self, PillarError> {
        let mut backends: Vec<Arc<dyn FileserverBackend>> = Vec::new();
        for name in &config.fileserver_backend {
            match name.as_str() {
                "roots" => backends.push(Arc::new(RootsBackend::new(
                    config.file_roots.clone(),
                    config.hash_type,
                ))),
                other => return Err(PillarError::UnknownBackend(other.to_string())),
            }
        }
        Ok(Self::new(
            backends,
            config.saltenv_whitelist.clone(),
            config.saltenv_blacklist.clone(),
        ))
    }

    pub fn env_allowed(&self, env: &str) -> bool {
        check_whitelist_blacklist(env, &self.whitelist, &self.blacklist)
    }

    pub async fn environments(&self) -> Result<Vec<String>, PillarError> {
        let mut envs = BTreeSet::new();
        for backend in &self.backends {
            envs.extend(backend.list_environments().await?);
        }
        Ok(envs.into_iter().filter(|e| self.env_allowed(e)).collect())
    }

    pub async fn file_list(&self, env: &str) -> Result<Vec<String>, PillarError> {
        if !self.env_allowed(env) {
            debug!(env, "environment refused by saltenv lists");
            return Ok(Vec::new());
        }
        let mut files = BTreeSet::new();
        for backend in &self.backends {
            files.extend(backend.list_files(env).await?);
        }
        Ok(files.into_iter().collect())
    }

    /// First backend holding `path` wins.
    pub async fn find_file(&self, env: &str, path: &str) -> Result<Option<FileEntry>, PillarError> {
        if !self.env_allowed(env) {
            return Ok(None);
        }
        for backend in &self.backends {
            if let Some(entry) = backend.fetch_file(env, path).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Refresh every backend; one failing backend does not stop the others.
    pub async fn update(&self) -> usize {
        let mut failed = 0;
        for backend in &self.backends {
            if let Err(e) = backend.update().await {
                warn!(backend = backend.name(), error = %e, "fileserver update failed");
                failed += 1;
            }
        }
        failed
    }
}
