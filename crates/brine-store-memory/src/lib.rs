//! In-memory store backend.
//!
//! Suitable for tests and for masters that run with `job_cache_backend: memory`.
//! Nothing survives a restart.

use std::collections::BTreeSet;

use async_trait::async_trait;
use brine_storage::{
    DataCache, Jid, Job, JobReturn, JobStore, KeyListing, KeyRecord, KeyState, KeyStore,
    MinionId, StoreError,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

struct JobEntry {
    reserved_at: DateTime<Utc>,
    origin: Option<String>,
    job: Option<Job>,
    minions: BTreeSet<MinionId>,
    returns: Vec<JobReturn>,
}

impl JobEntry {
    fn new(origin: Option<String>) -> Self {
        Self {
            reserved_at: Utc::now(),
            origin,
            job: None,
            minions: BTreeSet::new(),
            returns: Vec::new(),
        }
    }
}

/// DashMap backed implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    keys: DashMap<MinionId, KeyRecord>,
    denied: DashMap<MinionId, Vec<u8>>,
    jobs: DashMap<Jid, JobEntry>,
    cache: DashMap<(String, String), serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a reservation (used by retention tests and imports).
    pub fn set_reserved_at(&self, jid: &Jid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entry = self.jobs.get_mut(jid).ok_or(StoreError::NotFound)?;
        entry.reserved_at = at;
        Ok(())
    }
}

// ───────────────────────────────────── Keys ───────────────────────────────────────────

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get_key(&self, id: &MinionId) -> Result<KeyRecord, StoreError> {
        self.keys
            .get(id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn put_key(&self, record: &KeyRecord) -> Result<(), StoreError> {
        if record.state == KeyState::Denied {
            return Err(StoreError::Backend(
                "denied keys are recorded with record_denied".into(),
            ));
        }
        // One primary record per id, so a state change is a plain overwrite.
        self.keys.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_key(&self, id: &MinionId) -> Result<(), StoreError> {
        let primary = self.keys.remove(id).is_some();
        let denied = self.denied.remove(id).is_some();
        if primary || denied {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn list_keys(&self) -> Result<KeyListing, StoreError> {
        let mut listing = KeyListing::default();
        for record in self.keys.iter() {
            let bucket = match record.state {
                KeyState::Accepted => &mut listing.accepted,
                KeyState::Pending => &mut listing.pending,
                KeyState::Rejected => &mut listing.rejected,
                KeyState::Denied => &mut listing.denied,
            };
            bucket.push(record.id.clone());
        }
        listing
            .denied
            .extend(self.denied.iter().map(|r| r.key().clone()));
        listing.sort();
        Ok(listing)
    }

    async fn record_denied(&self, id: &MinionId, public_key: &[u8]) -> Result<(), StoreError> {
        self.denied.insert(id.clone(), public_key.to_vec());
        Ok(())
    }
}

// ───────────────────────────────────── Jobs ───────────────────────────────────────────

#[async_trait]
impl JobStore for MemoryStore {
    async fn reserve_jid(&self, jid: &Jid, origin: Option<&str>) -> Result<(), StoreError> {
        match self.jobs.entry(jid.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(JobEntry::new(origin.map(str::to_string)));
                Ok(())
            }
        }
    }

    async fn jid_origin(&self, jid: &Jid) -> Result<Option<String>, StoreError> {
        self.jobs
            .get(jid)
            .map(|e| e.origin.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_jids(&self) -> Result<Vec<Jid>, StoreError> {
        let mut jids: Vec<(DateTime<Utc>, Jid)> = self
            .jobs
            .iter()
            .map(|e| (e.reserved_at, e.key().clone()))
            .collect();
        jids.sort();
        Ok(jids.into_iter().map(|(_, jid)| jid).collect())
    }

    async fn clean_old_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired: Vec<Jid> = self
            .jobs
            .iter()
            .filter(|e| e.reserved_at < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for jid in &expired {
            self.jobs.remove(jid);
        }
        Ok(expired.len())
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs
            .entry(job.jid.clone())
            .or_insert_with(|| JobEntry::new(job.origin.clone()))
            .job = Some(job.clone());
        Ok(())
    }

    async fn get_job(&self, jid: &Jid) -> Result<Job, StoreError> {
        self.jobs
            .get(jid)
            .and_then(|e| e.job.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn add_minions(&self, jid: &Jid, minions: &[MinionId]) -> Result<(), StoreError> {
        self.jobs
            .entry(jid.clone())
            .or_insert_with(|| JobEntry::new(None))
            .minions
            .extend(minions.iter().cloned());
        Ok(())
    }

    async fn get_minions(&self, jid: &Jid) -> Result<Vec<MinionId>, StoreError> {
        self.jobs
            .get(jid)
            .map(|e| e.minions.iter().cloned().collect())
            .ok_or(StoreError::NotFound)
    }

    async fn save_return(&self, ret: &JobReturn) -> Result<(), StoreError> {
        let mut entry = self.jobs.entry(ret.jid.clone()).or_insert_with(|| JobEntry::new(None));
        if entry.returns.iter().any(|r| r.minion_id == ret.minion_id) {
            return Err(StoreError::Conflict);
        }
        entry.returns.push(ret.clone());
        Ok(())
    }

    async fn get_returns(&self, jid: &Jid) -> Result<Vec<JobReturn>, StoreError> {
        self.jobs
            .get(jid)
            .map(|e| e.returns.clone())
            .ok_or(StoreError::NotFound)
    }
}

// ───────────────────────────────────── Data cache ─────────────────────────────────────

fn in_bank(candidate: &str, bank: &str) -> bool {
    candidate == bank
        || candidate
            .strip_prefix(bank)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl DataCache for MemoryStore {
    async fn fetch(&self, bank: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .cache
            .get(&(bank.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn store(
        &self,
        bank: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.cache
            .insert((bank.to_string(), key.to_string()), data.clone());
        Ok(())
    }

    async fn flush(&self, bank: &str, key: Option<&str>) -> Result<(), StoreError> {
        match key {
            Some(key) => {
                self.cache.remove(&(bank.to_string(), key.to_string()));
            }
            None => self.cache.retain(|(b, _), _| !in_bank(b, bank)),
        }
        Ok(())
    }

    async fn list(&self, bank: &str) -> Result<Vec<String>, StoreError> {
        let mut names = BTreeSet::new();
        for entry in self.cache.iter() {
            let (b, k) = entry.key();
            if b == bank {
                names.insert(k.clone());
            } else if let Some(rest) = b.strip_prefix(bank).and_then(|r| r.strip_prefix('/')) {
                if let Some(child) = rest.split('/').next() {
                    names.insert(child.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_storage::Target;
    use chrono::Duration;

    fn record(id: &str, state: KeyState) -> KeyRecord {
        KeyRecord {
            id: MinionId::from(id),
            public_key: vec![7; 32],
            state,
            updated_at: Utc::now(),
        }
    }

    fn job(jid: &str) -> Job {
        Job {
            jid: Jid::from(jid),
            target: Target::glob("*"),
            fun: "test.ping".into(),
            args: vec![],
            user: "root".into(),
            origin: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn key_is_never_in_two_states() {
        let store = MemoryStore::new();
        store
            .put_key(&record("king_bob", KeyState::Accepted))
            .await
            .unwrap();
        store
            .put_key(&record("king_bob", KeyState::Rejected))
            .await
            .unwrap();

        let listing = store.list_keys().await.unwrap();
        assert!(listing.accepted.is_empty());
        assert_eq!(listing.rejected, vec![MinionId::from("king_bob")]);
    }

    #[tokio::test]
    async fn denied_keys_sit_beside_primary_record() {
        let store = MemoryStore::new();
        let id = MinionId::from("web01");
        store
            .put_key(&record("web01", KeyState::Accepted))
            .await
            .unwrap();
        store.record_denied(&id, &[1; 32]).await.unwrap();

        let listing = store.list_keys().await.unwrap();
        assert_eq!(listing.accepted, vec![id.clone()]);
        assert_eq!(listing.denied, vec![id.clone()]);

        store.delete_key(&id).await.unwrap();
        assert!(matches!(
            store.delete_key(&id).await,
            Err(StoreError::NotFound)
        ));
        assert!(store
            .put_key(&record("web01", KeyState::Denied))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reserve_jid_detects_collision() {
        let store = MemoryStore::new();
        let jid = Jid::from("20240101000000000000");
        store.reserve_jid(&jid, Some("top")).await.unwrap();
        assert!(matches!(
            store.reserve_jid(&jid, None).await,
            Err(StoreError::AlreadyExists)
        ));
        // the first reservation wins
        assert_eq!(store.jid_origin(&jid).await.unwrap().as_deref(), Some("top"));
        assert!(matches!(
            store.jid_origin(&Jid::from("20240101000000000001")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn returns_and_minions_accumulate() {
        let store = MemoryStore::new();
        let j = job("20240101000000000001");
        store.reserve_jid(&j.jid, None).await.unwrap();
        store.save_job(&j).await.unwrap();
        store
            .add_minions(&j.jid, &[MinionId::from("a"), MinionId::from("b")])
            .await
            .unwrap();
        store
            .add_minions(&j.jid, &[MinionId::from("b"), MinionId::from("c")])
            .await
            .unwrap();
        assert_eq!(store.get_minions(&j.jid).await.unwrap().len(), 3);

        let ret = JobReturn {
            jid: j.jid.clone(),
            minion_id: MinionId::from("a"),
            fun: "test.ping".into(),
            success: true,
            payload: serde_json::json!(true),
            ended_at: Utc::now(),
        };
        store.save_return(&ret).await.unwrap();
        assert!(matches!(
            store.save_return(&ret).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(store.get_returns(&j.jid).await.unwrap(), vec![ret]);
        assert_eq!(store.get_job(&j.jid).await.unwrap(), j);
    }

    #[tokio::test]
    async fn clean_old_jobs_uses_reservation_time() {
        let store = MemoryStore::new();
        let old = Jid::from("old");
        let fresh = Jid::from("fresh");
        store.reserve_jid(&old, None).await.unwrap();
        store.reserve_jid(&fresh, None).await.unwrap();
        store
            .set_reserved_at(&old, Utc::now() - Duration::hours(2))
            .unwrap();

        let removed = store
            .clean_old_jobs(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_jids().await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn data_cache_banks() {
        let store = MemoryStore::new();
        let grains = serde_json::json!({"os": "Debian"});
        store.store("minions/web01", "data", &grains).await.unwrap();
        store.store("minions/web02", "data", &grains).await.unwrap();

        assert_eq!(
            store.fetch("minions/web01", "data").await.unwrap(),
            Some(grains)
        );
        assert_eq!(
            store.list("minions").await.unwrap(),
            vec!["web01".to_string(), "web02".to_string()]
        );

        store.flush("minions/web01", None).await.unwrap();
        assert_eq!(store.fetch("minions/web01", "data").await.unwrap(), None);
        assert_eq!(store.list("minions").await.unwrap().len(), 1);
    }
}
