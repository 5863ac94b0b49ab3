use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brine_storage::{DataCache, StoreError};

use crate::{safe_join, write_atomic};

/// `<root>/<bank>/<key>.json`
pub struct FsDataCache {
    root: PathBuf,
}

impl FsDataCache {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn key_path(&self, bank: &str, key: &str) -> Result<PathBuf, StoreError> {
        if key.contains('/') {
            return Err(StoreError::Backend(format!("invalid cache key {:?}", key)));
        }
        Ok(safe_join(&self.root, bank)?.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl DataCache for FsDataCache {
    async fn fetch(&self, bank: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        match tokio::fs::read(self.key_path(bank, key)?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(
        &self,
        bank: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let path = self.key_path(bank, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &serde_json::to_vec(data)?).await
    }

    async fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), StoreError> {
        let result = match key {
            Some(key) => tokio::fs::remove_file(self.key_path(bank, key)?).await,
            None => tokio::fs::remove_dir_all(safe_join(&self.root, bank)?).await,
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self, bank: &str) -> Result<Vec<String>, StoreError> {
        let dir = safe_join(&self.root, bank)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                names.insert(name);
            } else if let Some(stem) = name.strip_suffix(".json") {
                names.insert(stem.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_fetch_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDataCache::new(dir.path());
        let grains = serde_json::json!({"os": "Debian", "roles": ["web"]});

        cache.store("minions/web01", "data", &grains).await.unwrap();
        assert_eq!(
            cache.fetch("minions/web01", "data").await.unwrap(),
            Some(grains)
        );
        assert_eq!(cache.list("minions").await.unwrap(), vec!["web01"]);
        assert_eq!(cache.list("minions/web01").await.unwrap(), vec!["data"]);

        cache.flush("minions/web01", Some("data")).await.unwrap();
        assert_eq!(cache.fetch("minions/web01", "data").await.unwrap(), None);
        cache.flush("minions", None).await.unwrap();
        assert!(cache.list("minions").await.unwrap().is_empty());
        // flushing something absent is not an error
        cache.flush("minions", None).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDataCache::new(dir.path());
        assert!(cache.fetch("../secrets", "x").await.is_err());
        assert!(cache
            .store("minions", "../x", &serde_json::Value::Null)
            .await
            .is_err());
    }
}
