//! The store traits that backends implement.

use chrono::{DateTime, Utc};

use crate::types::*;
use crate::StoreError;

/// Minion public keys and their acceptance state.
///
/// A minion id has at most one primary record (pending, accepted or rejected).
/// Writing a record in one state removes it from every other primary state.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    /// Get the primary key record for a minion.
    async fn get_key(&self, id: &MinionId) -> Result<KeyRecord, StoreError>;

    /// Insert or move a primary key record. `record.state` must not be `Denied`.
    async fn put_key(&self, record: &KeyRecord) -> Result<(), StoreError>;

    /// Remove every record (primary and denied) for a minion.
    async fn delete_key(&self, id: &MinionId) -> Result<(), StoreError>;

    /// All ids grouped by state.
    async fn list_keys(&self) -> Result<KeyListing, StoreError>;

    /// Keep a mismatching key for operator review.
    async fn record_denied(&self, id: &MinionId, public_key: &[u8]) -> Result<(), StoreError>;
}

/// Durable job metadata and minion returns keyed by JID.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    // ───────────────────────────────────── JIDs ───────────────────────────────────────────

    /// Record that a JID is in use, along with the master that relayed it
    /// (`None` for a locally generated JID). Fails with `AlreadyExists` on
    /// collision.
    ///
    /// Written even when job metadata caching is turned off.
    async fn reserve_jid(&self, jid: &Jid, origin: Option<&str>) -> Result<(), StoreError>;

    /// Origin recorded by [`JobStore::reserve_jid`]. `NotFound` when the JID
    /// is not reserved.
    async fn jid_origin(&self, jid: &Jid) -> Result<Option<String>, StoreError>;

    /// All reserved JIDs, oldest first.
    async fn list_jids(&self) -> Result<Vec<Jid>, StoreError>;

    /// Drop every job reserved before `cutoff`. Returns the number removed.
    async fn clean_old_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    // ───────────────────────────────────── Jobs ───────────────────────────────────────────

    /// Persist the job load.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, jid: &Jid) -> Result<Job, StoreError>;

    /// Union `minions` into the expected-minion list of a job.
    async fn add_minions(&self, jid: &Jid, minions: &[MinionId]) -> Result<(), StoreError>;

    async fn get_minions(&self, jid: &Jid) -> Result<Vec<MinionId>, StoreError>;

    // ───────────────────────────────────── Returns ────────────────────────────────────────

    /// Append a minion return. A second return from the same minion is a `Conflict`.
    async fn save_return(&self, ret: &JobReturn) -> Result<(), StoreError>;

    async fn get_returns(&self, jid: &Jid) -> Result<Vec<JobReturn>, StoreError>;
}

/// Bank/key cache for per-minion data (grains, pillar, mine).
#[async_trait::async_trait]
pub trait DataCache: Send + Sync {
    async fn fetch(&self, bank: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn store(&self, bank: &str, key: &str, data: &serde_json::Value)
        -> Result<(), StoreError>;

    /// Remove one key, or the whole bank when `key` is `None`.
    async fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), StoreError>;

    /// Keys in a bank (sub-banks included by name).
    async fn list(&self, bank: &str) -> Result<Vec<String>, StoreError>;
}
