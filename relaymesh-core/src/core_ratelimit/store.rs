//! Shared counter store seam
//!
//! Rate-limit counters are mirrored into hashes keyed `ratelimit:<key>` whose
//! fields are unix seconds and whose values are hit counts for that second.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Error)]
pub enum CounterStoreError {
    #[error("Shared counter store is disabled")]
    Disabled,

    #[error("Shared counter store operation failed: {0}")]
    Backend(String),
}

/// Hash-of-counters store shared between control plane replicas
#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Whether the store should be consulted at all
    fn is_enabled(&self) -> bool;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<u64>, CounterStoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<(), CounterStoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>, CounterStoreError>;

    /// Set the time-to-live of a whole key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError>;

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError>;

    /// Keys starting with `prefix`
    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, CounterStoreError>;

    /// Add `delta` to a field and return the new value
    ///
    /// The default is a read followed by a write; backends with an atomic
    /// increment should override it.
    async fn hash_increment(&self, key: &str, field: &str, delta: u64) -> Result<u64, CounterStoreError> {
        let current = self.hash_get(key, field).await?.unwrap_or(0);
        let updated = current.saturating_add(delta);
        self.hash_set(key, field, updated).await?;
        Ok(updated)
    }
}

/// Store that is never consulted; the tracker counts locally only
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCounterStore;

#[async_trait]
impl SharedCounterStore for DisabledCounterStore {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<u64>, CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }

    async fn hash_set(&self, _key: &str, _field: &str, _value: u64) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }

    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, u64>, CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }

    async fn delete(&self, _key: &str) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }

    async fn keys_matching(&self, _prefix: &str) -> Result<Vec<String>, CounterStoreError> {
        Err(CounterStoreError::Disabled)
    }
}

#[derive(Debug, Default)]
struct StoredHash {
    fields: HashMap<String, u64>,
    expires_at_ms: Option<u64>,
}

/// Process-local store with key expiry driven by a [`crate::clock::Clock`]
///
/// Useful for single-replica deployments and for tests that need to observe
/// what the tracker wrote back.
pub struct InMemoryCounterStore {
    hashes: Mutex<HashMap<String, StoredHash>>,
    clock: SharedClock,
}

impl InMemoryCounterStore {
    pub fn new(clock: SharedClock) -> Self {
        Self { hashes: Mutex::new(HashMap::new()), clock }
    }

    fn now_ms(&self) -> Result<u64, CounterStoreError> {
        self.clock.now_ms().map_err(|e| CounterStoreError::Backend(e.to_string()))
    }

    fn purge_expired(hashes: &mut HashMap<String, StoredHash>, now_ms: u64) {
        hashes.retain(|_, h| h.expires_at_ms.map_or(true, |at| at > now_ms));
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.now_ms().unwrap_or(0);
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        hashes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sum of every field of a key
    pub async fn total(&self, key: &str) -> u64 {
        self.hash_get_all(key).await.map(|h| h.values().sum()).unwrap_or(0)
    }
}

#[async_trait]
impl SharedCounterStore for InMemoryCounterStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<u64>, CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        Ok(hashes.get(key).and_then(|h| h.fields.get(field).copied()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<(), CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        hashes.entry(key.to_string()).or_default().fields.insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>, CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        Ok(hashes.get(key).map(|h| h.fields.clone()).unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        if let Some(hash) = hashes.get_mut(key) {
            hash.expires_at_ms = Some(now + ttl.as_millis() as u64);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        self.hashes.lock().await.remove(key);
        Ok(())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        let mut keys: Vec<String> = hashes.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: u64) -> Result<u64, CounterStoreError> {
        let now = self.now_ms()?;
        let mut hashes = self.hashes.lock().await;
        Self::purge_expired(&mut hashes, now);
        let value = hashes
            .entry(key.to_string())
            .or_default()
            .fields
            .entry(field.to_string())
            .or_insert(0);
        *value = value.saturating_add(delta);
        Ok(*value)
    }
}
