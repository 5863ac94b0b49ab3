//! Per-worker LRU in front of the minion data cache.

use std::collections::HashMap;
use std::time::Duration;

use brine_config::MasterConfig;
use brine_storage::{DataCache, StoreError};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::StoreBackend;

struct Slot {
    stored: Instant,
    used: u64,
    value: Option<serde_json::Value>,
}

/// Owned by exactly one worker, so it needs no locking.
pub struct MemCache {
    inner: StoreBackend,
    expire: Duration,
    max_items: usize,
    full_cleanup: bool,
    slots: HashMap<(String, String), Slot>,
    clock: u64,
}

impl MemCache {
    pub fn new(inner: StoreBackend, expire: Duration, max_items: usize, full_cleanup: bool) -> Self {
        Self {
            inner,
            expire,
            max_items,
            full_cleanup,
            slots: HashMap::new(),
            clock: 0,
        }
    }

    pub fn from_config(inner: StoreBackend, config: &MasterConfig) -> Self {
        Self::new(
            inner,
            Duration::from_secs(config.memcache_expire_seconds),
            config.memcache_max_items,
            config.memcache_full_cleanup,
        )
    }

    fn enabled(&self) -> bool {
        !self.expire.is_zero()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remember(&mut self, bank: &str, key: &str, value: Option<serde_json::Value>) {
        let used = self.tick();
        self.slots.insert(
            (bank.to_string(), key.to_string()),
            Slot {
                stored: Instant::now(),
                used,
                value,
            },
        );
        if self.slots.len() > self.max_items {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if self.full_cleanup {
            let expire = self.expire;
            let before = self.slots.len();
            self.slots.retain(|_, slot| slot.stored.elapsed() < expire);
            debug!(dropped = before - self.slots.len(), "memcache cleanup");
        }
        while self.slots.len() > self.max_items {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.slots.remove(&k);
                }
                None => break,
            }
        }
    }

    pub async fn fetch(
        &mut self,
        bank: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if !self.enabled() {
            return self.inner.fetch(bank, key).await;
        }
        let expire = self.expire;
        let used = self.tick();
        if let Some(slot) = self.slots.get_mut(&(bank.to_string(), key.to_string())) {
            if slot.stored.elapsed() < expire {
                slot.used = used;
                return Ok(slot.value.clone());
            }
        }
        let value = self.inner.fetch(bank, key).await?;
        self.remember(bank, key, value.clone());
        Ok(value)
    }

    pub async fn store(
        &mut self,
        bank: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.store(bank, key, data).await?;
        if self.enabled() {
            self.remember(bank, key, Some(data.clone()));
        }
        Ok(())
    }

    pub async fn flush(&mut self, bank: &str, key: Option<&str>) -> Result<(), StoreError> {
        self.inner.flush(bank, key).await?;
        match key {
            Some(key) => {
                self.slots.remove(&(bank.to_string(), key.to_string()));
            }
            None => self.slots.retain(|(b, _), _| b != bank),
        }
        Ok(())
    }

    pub async fn list(&self, bank: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(bank).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_store_memory::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(expire_ms: u64, max: usize, full: bool) -> (Arc<MemoryStore>, MemCache) {
        let mem = Arc::new(MemoryStore::new());
        let cache = MemCache::new(
            StoreBackend::Memory(mem.clone()),
            Duration::from_millis(expire_ms),
            max,
            full,
        );
        (mem, cache)
    }

    #[tokio::test]
    async fn hits_are_served_from_memory() {
        let (mem, mut cache) = setup(60_000, 10, false);
        mem.store("grains", "web01", &json!({"os": "Debian"})).await.unwrap();
        assert_eq!(
            cache.fetch("grains", "web01").await.unwrap(),
            Some(json!({"os": "Debian"}))
        );
        // change underneath; the memcache still answers
        mem.store("grains", "web01", &json!({"os": "Arch"})).await.unwrap();
        assert_eq!(
            cache.fetch("grains", "web01").await.unwrap(),
            Some(json!({"os": "Debian"}))
        );
    }

    #[tokio::test]
    async fn zero_expiry_disables() {
        let (mem, mut cache) = setup(0, 10, false);
        mem.store("grains", "a", &json!(1)).await.unwrap();
        cache.fetch("grains", "a").await.unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let (mem, mut cache) = setup(60_000, 2, false);
        for k in ["a", "b", "c"] {
            mem.store("bank", k, &json!(k)).await.unwrap();
        }
        cache.fetch("bank", "a").await.unwrap();
        cache.fetch("bank", "b").await.unwrap();
        cache.fetch("bank", "a").await.unwrap(); // refresh a
        cache.fetch("bank", "c").await.unwrap(); // evicts b
        assert_eq!(cache.len(), 2);
        assert!(cache.slots.contains_key(&("bank".to_string(), "a".to_string())));
        assert!(!cache.slots.contains_key(&("bank".to_string(), "b".to_string())));
    }

    #[tokio::test]
    async fn full_cleanup_drops_expired_first() {
        let (mem, mut cache) = setup(50, 3, true);
        for k in ["a", "b", "c", "d"] {
            mem.store("bank", k, &json!(k)).await.unwrap();
        }
        cache.fetch("bank", "a").await.unwrap();
        cache.fetch("bank", "b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.fetch("bank", "c").await.unwrap();
        cache.fetch("bank", "d").await.unwrap(); // over capacity: a and b are expired
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn writes_go_through() {
        let (mem, mut cache) = setup(60_000, 10, false);
        cache.store("pillar", "web01", &json!({"k": 1})).await.unwrap();
        assert_eq!(mem.fetch("pillar", "web01").await.unwrap(), Some(json!({"k": 1})));
        cache.flush("pillar", None).await.unwrap();
        assert_eq!(cache.fetch("pillar", "web01").await.unwrap(), None);
    }
}
