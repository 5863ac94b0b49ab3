use std::path::{Path, PathBuf};

use async_trait::async_trait;
use brine_storage::{KeyListing, KeyRecord, KeyState, KeyStore, MinionId, StoreError};
use chrono::{DateTime, Utc};

use crate::write_atomic;

const PRIMARY_STATES: [KeyState; 3] = [KeyState::Accepted, KeyState::Pending, KeyState::Rejected];

fn state_dir(state: KeyState) -> &'static str {
    match state {
        KeyState::Accepted => "minions",
        KeyState::Pending => "minions_pre",
        KeyState::Rejected => "minions_rejected",
        KeyState::Denied => "minions_denied",
    }
}

/// Key store laid out as a master pki directory: one hex encoded public key
/// file per minion in `minions/`, `minions_pre/`, `minions_rejected/` or
/// `minions_denied/`.
pub struct FsKeyStore {
    root: PathBuf,
}

impl FsKeyStore {
    /// Open (and create) the state directories under `pki_dir`.
    pub async fn open(pki_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = pki_dir.as_ref().to_path_buf();
        for state in PRIMARY_STATES.iter().chain([KeyState::Denied].iter()) {
            tokio::fs::create_dir_all(root.join(state_dir(*state))).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, state: KeyState, id: &MinionId) -> Result<PathBuf, StoreError> {
        if !id.is_valid() {
            return Err(StoreError::Backend(format!("invalid minion id {:?}", id.0)));
        }
        Ok(self.root.join(state_dir(state)).join(&id.0))
    }

    async fn read_record(
        &self,
        state: KeyState,
        id: &MinionId,
    ) -> Result<Option<KeyRecord>, StoreError> {
        let path = self.path(state, id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let public_key = hex::decode(contents.trim())
            .map_err(|e| StoreError::Backend(format!("corrupt key file {}: {}", path.display(), e)))?;
        let updated_at = tokio::fs::metadata(&path)
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(KeyRecord {
            id: id.clone(),
            public_key,
            state,
            updated_at,
        }))
    }

    async fn remove_if_present(&self, path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn ids_in(&self, state: KeyState) -> Result<Vec<MinionId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(state_dir(state))).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(MinionId(name.to_string()));
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl KeyStore for FsKeyStore {
    async fn get_key(&self, id: &MinionId) -> Result<KeyRecord, StoreError> {
        for state in PRIMARY_STATES {
            if let Some(record) = self.read_record(state, id).await? {
                return Ok(record);
            }
        }
        Err(StoreError::NotFound)
    }

    async fn put_key(&self, record: &KeyRecord) -> Result<(), StoreError> {
        if record.state == KeyState::Denied {
            return Err(StoreError::Backend(
                "denied keys are recorded with record_denied".into(),
            ));
        }
        // Clear the other states first so a key is never visible in two of them.
        for state in PRIMARY_STATES {
            if state != record.state {
                self.remove_if_present(&self.path(state, &record.id)?).await?;
            }
        }
        let path = self.path(record.state, &record.id)?;
        write_atomic(&path, hex::encode(&record.public_key).as_bytes()).await
    }

    async fn delete_key(&self, id: &MinionId) -> Result<(), StoreError> {
        let mut removed = false;
        for state in PRIMARY_STATES.iter().chain([KeyState::Denied].iter()) {
            removed |= self.remove_if_present(&self.path(*state, id)?).await?;
        }
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn list_keys(&self) -> Result<KeyListing, StoreError> {
        let mut listing = KeyListing {
            accepted: self.ids_in(KeyState::Accepted).await?,
            pending: self.ids_in(KeyState::Pending).await?,
            rejected: self.ids_in(KeyState::Rejected).await?,
            denied: self.ids_in(KeyState::Denied).await?,
        };
        listing.sort();
        Ok(listing)
    }

    async fn record_denied(&self, id: &MinionId, public_key: &[u8]) -> Result<(), StoreError> {
        let path = self.path(KeyState::Denied, id)?;
        write_atomic(&path, hex::encode(public_key).as_bytes()).await
    }
}
