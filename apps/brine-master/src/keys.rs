//! Minion key acceptance.

use std::collections::BTreeMap;
use std::sync::Arc;

use brine_config::MasterConfig;
use brine_crypto::{fingerprint, HashType};
use brine_storage::{KeyListing, KeyRecord, KeyState, KeyStore, MinionId, StoreError};
use brine_targeting::expr_match;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::autosign::Autosigner;
use crate::backend::StoreBackend;
use crate::session::SessionKeyring;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid minion id: {0:?}")]
    InvalidId(String),
    #[error("public key must be 32 bytes, got {0}")]
    MalformedKey(usize),
    #[error("no key matches {0}")]
    NoMatch(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Pending,
    Rejected,
    /// `max_minions` reached.
    Full,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Pending => "pending",
            Decision::Rejected => "rejected",
            Decision::Full => "full",
        }
    }
}

pub struct KeyManager {
    store: StoreBackend,
    autosign: Autosigner,
    sessions: Arc<SessionKeyring>,
    open_mode: bool,
    max_minions: usize,
    rotate_aes_key: bool,
    hash_type: HashType,
}

impl KeyManager {
    pub fn new(store: StoreBackend, sessions: Arc<SessionKeyring>, config: &MasterConfig) -> Self {
        Self {
            store,
            autosign: Autosigner::from_config(config),
            sessions,
            open_mode: config.open_mode,
            max_minions: config.max_minions,
            rotate_aes_key: config.rotate_aes_key,
            hash_type: config.hash_type,
        }
    }

    pub fn autosigner(&self) -> &Autosigner {
        &self.autosign
    }

    async fn put(&self, id: &MinionId, public_key: &[u8], state: KeyState) -> Result<(), KeyError> {
        self.store
            .put_key(&KeyRecord {
                id: id.clone(),
                public_key: public_key.to_vec(),
                state,
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn deny(&self, id: &MinionId, public_key: &[u8]) -> Result<Decision, KeyError> {
        self.store.record_denied(id, public_key).await?;
        Ok(Decision::Rejected)
    }

    async fn at_capacity(&self, id: &MinionId) -> Result<bool, KeyError> {
        if self.max_minions == 0 {
            return Ok(false);
        }
        let listing = self.store.list_keys().await?;
        Ok(!listing.accepted.contains(id) && listing.accepted.len() >= self.max_minions)
    }

    /// Decide what to do with a presented key, persisting the outcome.
    pub async fn request_key(
        &self,
        id: &MinionId,
        public_key: &[u8],
        grains: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Decision, KeyError> {
        if !id.is_valid() {
            return Err(KeyError::InvalidId(id.0.clone()));
        }
        if public_key.len() != 32 {
            return Err(KeyError::MalformedKey(public_key.len()));
        }
        if self.at_capacity(id).await? {
            warn!(minion_id = %id, max_minions = self.max_minions, "refusing key, too many minions");
            return Ok(Decision::Full);
        }
        if self.open_mode {
            self.put(id, public_key, KeyState::Accepted).await?;
            return Ok(Decision::Accepted);
        }

        let existing = match self.store.get_key(id).await {
            Ok(record) => Some(record),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(record) = existing else {
            if self.autosign.autorejected(id).await {
                info!(minion_id = %id, "new key rejected by autoreject_file");
                self.put(id, public_key, KeyState::Rejected).await?;
                return Ok(Decision::Rejected);
            }
            if !self.autosign.autosigned(id, grains).await {
                info!(minion_id = %id, "new key is pending acceptance");
                self.put(id, public_key, KeyState::Pending).await?;
                return Ok(Decision::Pending);
            }
            info!(minion_id = %id, "new key accepted automatically");
            self.put(id, public_key, KeyState::Accepted).await?;
            return Ok(Decision::Accepted);
        };

        let same_key = record.public_key == public_key;
        match record.state {
            KeyState::Rejected | KeyState::Denied => {
                info!(minion_id = %id, "key is rejected");
                Ok(Decision::Rejected)
            }
            KeyState::Accepted if same_key => Ok(Decision::Accepted),
            KeyState::Accepted => {
                error!(
                    minion_id = %id,
                    "authentication attempt from minion whose keys did not match the accepted key"
                );
                self.deny(id, public_key).await
            }
            KeyState::Pending => {
                if self.autosign.autorejected(id).await {
                    info!(minion_id = %id, "pending key rejected by autoreject_file");
                    if !same_key {
                        self.store.record_denied(id, public_key).await?;
                    }
                    self.put(id, &record.public_key, KeyState::Rejected).await?;
                    return Ok(Decision::Rejected);
                }
                if !self.autosign.autosigned(id, grains).await {
                    if same_key {
                        return Ok(Decision::Pending);
                    }
                    error!(minion_id = %id, "pending key does not match the presented key");
                    return self.deny(id, public_key).await;
                }
                if !same_key {
                    error!(minion_id = %id, "autosign refused, key differs from the pending key");
                    return self.deny(id, public_key).await;
                }
                info!(minion_id = %id, "pending key accepted automatically");
                self.put(id, public_key, KeyState::Accepted).await?;
                Ok(Decision::Accepted)
            }
        }
    }

    /// Public key of an accepted minion.
    pub async fn accepted_key(&self, id: &MinionId) -> Result<Option<Vec<u8>>, KeyError> {
        match self.store.get_key(id).await {
            Ok(record) if record.state == KeyState::Accepted => Ok(Some(record.public_key)),
            Ok(_) | Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_keys(&self) -> Result<KeyListing, KeyError> {
        let mut listing = self.store.list_keys().await?;
        listing.sort();
        Ok(listing)
    }

    fn matching(ids: &[MinionId], pattern: &str) -> Vec<MinionId> {
        ids.iter()
            .filter(|id| expr_match(id.as_str(), pattern))
            .cloned()
            .collect()
    }

    async fn transition(
        &self,
        pattern: &str,
        from: &[KeyState],
        to: KeyState,
    ) -> Result<(Vec<MinionId>, bool), KeyError> {
        let listing = self.store.list_keys().await?;
        let mut changed = Vec::new();
        let mut touched_accepted = false;
        for state in from {
            for id in Self::matching(listing.ids(*state), pattern) {
                let record = self.store.get_key(&id).await?;
                self.put(&id, &record.public_key, to).await?;
                touched_accepted |= *state == KeyState::Accepted;
                changed.push(id);
            }
        }
        if changed.is_empty() {
            return Err(KeyError::NoMatch(pattern.to_string()));
        }
        changed.sort();
        Ok((changed, touched_accepted))
    }

    fn revoked(&self, reason: &str) {
        if self.rotate_aes_key {
            let version = self.sessions.rotate();
            info!(version, reason, "rotated session key after key revocation");
        }
    }

    pub async fn accept(
        &self,
        pattern: &str,
        include_rejected: bool,
    ) -> Result<Vec<MinionId>, KeyError> {
        let from: &[KeyState] = if include_rejected {
            &[KeyState::Pending, KeyState::Rejected]
        } else {
            &[KeyState::Pending]
        };
        let (ids, _) = self.transition(pattern, from, KeyState::Accepted).await?;
        info!(count = ids.len(), pattern, "accepted keys");
        Ok(ids)
    }

    pub async fn reject(
        &self,
        pattern: &str,
        include_accepted: bool,
    ) -> Result<Vec<MinionId>, KeyError> {
        let from: &[KeyState] = if include_accepted {
            &[KeyState::Pending, KeyState::Accepted]
        } else {
            &[KeyState::Pending]
        };
        let (ids, touched_accepted) = self.transition(pattern, from, KeyState::Rejected).await?;
        info!(count = ids.len(), pattern, "rejected keys");
        if touched_accepted {
            self.revoked("reject");
        }
        Ok(ids)
    }

    /// Delete every record for the matching ids.
    pub async fn delete(&self, pattern: &str) -> Result<Vec<MinionId>, KeyError> {
        let listing = self.store.list_keys().await?;
        let mut ids = Vec::new();
        let mut touched_accepted = false;
        for state in [
            KeyState::Accepted,
            KeyState::Pending,
            KeyState::Rejected,
            KeyState::Denied,
        ] {
            for id in Self::matching(listing.ids(state), pattern) {
                touched_accepted |= state == KeyState::Accepted;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        if ids.is_empty() {
            return Err(KeyError::NoMatch(pattern.to_string()));
        }
        for id in &ids {
            self.store.delete_key(id).await?;
        }
        ids.sort();
        info!(count = ids.len(), pattern, "deleted keys");
        if touched_accepted {
            self.revoked("delete");
        }
        Ok(ids)
    }

    /// Fingerprints of matching primary keys, keyed by minion id.
    pub async fn finger(&self, pattern: &str) -> Result<BTreeMap<String, String>, KeyError> {
        let listing = self.store.list_keys().await?;
        let mut out = BTreeMap::new();
        for state in [KeyState::Accepted, KeyState::Pending, KeyState::Rejected] {
            for id in Self::matching(listing.ids(state), pattern) {
                let record = self.store.get_key(&id).await?;
                out.insert(id.0, fingerprint(&record.public_key, self.hash_type));
            }
        }
        Ok(out)
    }
}
