//! Stand-ins for external collaborators

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core_exit::OnlineProbe;
use crate::core_ratelimit::{CounterStoreError, SharedCounterStore};

/// Shared counter store that is configured but always errors
#[derive(Debug, Default)]
pub struct FailingCounterStore {
    calls: AtomicUsize,
}

impl FailingCounterStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, CounterStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CounterStoreError::Backend("connection refused".to_string()))
    }
}

#[async_trait]
impl SharedCounterStore for FailingCounterStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<u64>, CounterStoreError> {
        self.fail()
    }

    async fn hash_set(&self, _key: &str, _field: &str, _value: u64) -> Result<(), CounterStoreError> {
        self.fail()
    }

    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, u64>, CounterStoreError> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), CounterStoreError> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<(), CounterStoreError> {
        self.fail()
    }

    async fn keys_matching(&self, _prefix: &str) -> Result<Vec<String>, CounterStoreError> {
        self.fail()
    }
}

/// Probe with a fixed answer that can be flipped
#[derive(Debug, Default)]
pub struct StaticProbe {
    online: AtomicBool,
    probes: AtomicUsize,
}

impl StaticProbe {
    pub fn online() -> Self {
        Self { online: AtomicBool::new(true), probes: AtomicUsize::new(0) }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OnlineProbe for StaticProbe {
    async fn is_online(&self, endpoint: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !endpoint.is_empty() && self.online.load(Ordering::SeqCst)
    }
}
