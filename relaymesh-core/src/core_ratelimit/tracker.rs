//! Per-client fixed-window rate limiting
//!
//! Decisions are made against a local counter per key. Local counters are
//! seeded from, and periodically written back to, a [`SharedCounterStore`] so
//! that several control plane replicas converge on roughly the same totals.
//! When the store is disabled or failing the tracker keeps counting locally.

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::store::{CounterStoreError, SharedCounterStore};
use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

const STORE_KEY_PREFIX: &str = "ratelimit:";

/// Limits applied by a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Hits allowed per client per window
    pub max_requests: u64,
    /// Hits allowed per client and message type per window
    pub message_type_limit: Option<u64>,
    pub window: Duration,
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            message_type_limit: Some(config.message_type_limit),
            window: config.window,
        }
    }
}

/// Which counter tripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitReason {
    Global,
    MessageType(String),
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitReason::Global => f.write_str("global"),
            LimitReason::MessageType(t) => write!(f, "message_type:{}", t),
        }
    }
}

/// Outcome of [`RateLimitTracker::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub is_limited: bool,
    pub reason: Option<LimitReason>,
    /// Hits counted in the current window by the reported counter
    pub total_hits: u64,
    /// Unix milliseconds at which the reported window ends
    pub reset_time_ms: u64,
}

impl RateLimitDecision {
    fn unchecked() -> Self {
        Self { is_limited: false, reason: None, total_hits: 0, reset_time_ms: 0 }
    }

    pub fn reset_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.reset_time_ms)
    }
}

/// Read-only view of a local counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub count: u64,
    pub pending: u64,
    pub last_synced_count: u64,
    pub window_start_ms: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub flushed: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Entry {
    count: u64,
    pending: u64,
    last_synced_count: u64,
    window_start_ms: u64,
    window_ms: u64,
    initialized: bool,
    /// Removed from the map by cleanup; hits must look the key up again
    evicted: bool,
}

impl Entry {
    fn window_end_ms(&self) -> u64 {
        self.window_start_ms + self.window_ms
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        !self.initialized || now_ms.saturating_sub(self.window_start_ms) >= self.window_ms
    }

    /// Store field for hits recorded at `now_ms`, kept inside this window
    fn bucket_second(&self, now_ms: u64) -> u64 {
        let last_ms = self.window_end_ms().saturating_sub(1).max(self.window_start_ms);
        now_ms.clamp(self.window_start_ms, last_ms) / 1000
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            count: self.count,
            pending: self.pending,
            last_synced_count: self.last_synced_count,
            window_start_ms: self.window_start_ms,
            window_ms: self.window_ms,
        }
    }
}

type Slot = Arc<Mutex<Entry>>;

struct Hit {
    count: u64,
    reset_time_ms: u64,
}

fn store_key(key: &str) -> String {
    format!("{}{}", STORE_KEY_PREFIX, key)
}

fn type_key(client_id: &str, message_type: &str) -> String {
    format!("{}:{}", client_id, message_type)
}

/// Local-first rate limiter backed by a shared counter store
pub struct RateLimitTracker {
    config: RateLimitConfig,
    store: Arc<dyn SharedCounterStore>,
    clock: SharedClock,
    entries: Mutex<HashMap<String, Slot>>,
}

impl RateLimitTracker {
    pub fn new(config: RateLimitConfig, store: Arc<dyn SharedCounterStore>, clock: SharedClock) -> Self {
        Self { config, store, clock, entries: Mutex::new(HashMap::new()) }
    }

    /// Policy built from the configured defaults
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::from(&self.config)
    }

    /// Check with the configured default policy
    pub async fn check_default(&self, client_id: &str, message_type: Option<&str>) -> RateLimitDecision {
        let policy = self.default_policy();
        self.check(client_id, message_type, &policy).await
    }

    /// Count one hit for `client_id` (and `message_type`) and decide
    ///
    /// The global counter is checked first; a globally limited hit does not
    /// touch the per-type counter. Never fails: internal errors are logged and
    /// the hit is allowed.
    pub async fn check(
        &self,
        client_id: &str,
        message_type: Option<&str>,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let now_ms = match self.clock.now_ms() {
            Ok(now) => now,
            Err(e) => {
                error!(client_id, error = %e, "Rate limit check failed, allowing request");
                return RateLimitDecision::unchecked();
            }
        };
        let window = if policy.window.is_zero() {
            warn!(client_id, default_window = ?self.config.window, "Rate limit policy has a zero window, using the default");
            self.config.window
        } else {
            policy.window
        };
        let window_ms = (window.as_millis() as u64).max(1);

        let global = self.hit(client_id, window_ms, now_ms).await;
        if global.count >= policy.max_requests {
            warn!(
                client_id,
                total_hits = global.count,
                limit = policy.max_requests,
                "Request blocked: global rate limit exceeded"
            );
            metrics::rate_limit_decision("global");
            return RateLimitDecision {
                is_limited: true,
                reason: Some(LimitReason::Global),
                total_hits: global.count,
                reset_time_ms: global.reset_time_ms,
            };
        }

        let typed = message_type.filter(|t| !t.is_empty()).zip(policy.message_type_limit);
        if let Some((message_type, limit)) = typed {
            let per_type = self.hit(&type_key(client_id, message_type), window_ms, now_ms).await;
            if per_type.count >= limit {
                warn!(
                    client_id,
                    message_type,
                    total_hits = per_type.count,
                    limit,
                    "Request blocked: message type rate limit exceeded"
                );
                metrics::rate_limit_decision("message_type");
                return RateLimitDecision {
                    is_limited: true,
                    reason: Some(LimitReason::MessageType(message_type.to_string())),
                    total_hits: per_type.count,
                    reset_time_ms: per_type.reset_time_ms,
                };
            }
        }

        trace!(client_id, total_hits = global.count, "Request allowed");
        metrics::rate_limit_decision("allowed");
        RateLimitDecision {
            is_limited: false,
            reason: None,
            total_hits: global.count,
            reset_time_ms: global.reset_time_ms,
        }
    }

    async fn slot(&self, key: &str) -> Slot {
        let mut entries = self.entries.lock().await;
        entries.entry(key.to_string()).or_default().clone()
    }

    async fn existing_slot(&self, key: &str) -> Option<Slot> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn hit(&self, key: &str, window_ms: u64, now_ms: u64) -> Hit {
        loop {
            let slot = self.slot(key).await;
            if let Some(hit) = self.hit_slot(key, slot, window_ms, now_ms).await {
                return hit;
            }
            trace!(key, "Rate limit entry evicted before it was locked, retrying");
        }
    }

    /// Count a hit on `slot`, or `None` when cleanup evicted it after lookup
    async fn hit_slot(&self, key: &str, slot: Slot, window_ms: u64, now_ms: u64) -> Option<Hit> {
        let mut entry = slot.lock().await;
        if entry.evicted {
            return None;
        }

        if entry.is_expired(now_ms) {
            self.start_window(key, &mut entry, window_ms, now_ms).await;
        }

        entry.count += 1;
        entry.pending += 1;

        if self.store.is_enabled() && entry.pending >= self.config.sync_threshold {
            let delta = std::mem::take(&mut entry.pending);
            self.spawn_write_back(key, slot.clone(), &entry, delta, now_ms);
        }

        Some(Hit { count: entry.count, reset_time_ms: entry.window_end_ms() })
    }

    /// Open a fresh window, flushing the previous one and seeding from the store
    async fn start_window(&self, key: &str, entry: &mut Entry, window_ms: u64, now_ms: u64) {
        let mut cutoff_ms = now_ms.saturating_sub(window_ms);

        if entry.initialized {
            if entry.pending > 0 && self.store.is_enabled() {
                let delta = std::mem::take(&mut entry.pending);
                let bucket = entry.bucket_second(now_ms);
                if let Err(e) = self.write_back(key, bucket, delta, entry.window_ms).await {
                    error!(key, delta, error = %e, "Failed to flush expired rate limit window");
                }
            }
            cutoff_ms = cutoff_ms.max(entry.window_end_ms());
        }

        let seed = self.seed_count(key, cutoff_ms, now_ms).await;
        debug!(key, seed, window_ms, "Starting rate limit window");

        *entry = Entry {
            count: seed,
            pending: 0,
            last_synced_count: seed,
            window_start_ms: now_ms,
            window_ms,
            initialized: true,
            evicted: false,
        };
    }

    async fn seed_count(&self, key: &str, cutoff_ms: u64, now_ms: u64) -> u64 {
        if !self.store.is_enabled() {
            return 0;
        }

        match self.store.hash_get_all(&store_key(key)).await {
            Ok(fields) => fields
                .iter()
                .filter_map(|(field, hits)| field.parse::<u64>().ok().map(|sec| (sec * 1000, *hits)))
                .filter(|(at_ms, _)| *at_ms >= cutoff_ms && *at_ms <= now_ms)
                .map(|(_, hits)| hits)
                .sum(),
            Err(e) => {
                error!(key, error = %e, "Failed to read shared rate limit counters, counting locally");
                metrics::rate_limit_store_error("hash_get_all");
                0
            }
        }
    }

    async fn write_back(&self, key: &str, bucket_sec: u64, delta: u64, window_ms: u64) -> Result<(), CounterStoreError> {
        let ttl = Duration::from_millis(window_ms) + self.config.key_ttl_grace;
        let result = write_back(self.store.as_ref(), key, bucket_sec, delta, ttl).await;
        metrics::rate_limit_sync(result.is_ok());
        result
    }

    fn spawn_write_back(&self, key: &str, slot: Slot, entry: &Entry, delta: u64, now_ms: u64) {
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        let bucket = entry.bucket_second(now_ms);
        let window_start_ms = entry.window_start_ms;
        let synced_count = entry.count;
        let ttl = Duration::from_millis(entry.window_ms) + self.config.key_ttl_grace;

        tokio::spawn(async move {
            let result = write_back(store.as_ref(), &key, bucket, delta, ttl).await;
            metrics::rate_limit_sync(result.is_ok());

            let mut entry = slot.lock().await;
            let same_window = entry.initialized && entry.window_start_ms == window_start_ms;
            match result {
                Ok(()) => {
                    if same_window {
                        entry.last_synced_count = entry.last_synced_count.max(synced_count);
                    }
                    debug!(key = %key, delta, "Synced rate limit counter");
                }
                Err(e) if same_window => {
                    entry.pending += delta;
                    error!(key = %key, delta, error = %e, "Failed to sync rate limit counter, will retry");
                }
                Err(e) => {
                    error!(key = %key, delta, error = %e, "Failed to sync rate limit counter of a closed window");
                }
            }
        });
    }

    /// Undo one hit, e.g. for requests that should not count
    pub async fn decrement(&self, client_id: &str, message_type: Option<&str>) {
        let mut keys = vec![client_id.to_string()];
        if let Some(t) = message_type.filter(|t| !t.is_empty()) {
            keys.push(type_key(client_id, t));
        }

        for key in keys {
            if let Some(slot) = self.existing_slot(&key).await {
                let mut entry = slot.lock().await;
                if entry.count > 0 {
                    entry.count -= 1;
                    entry.pending = entry.pending.saturating_sub(1);
                }
            }
        }
    }

    /// Forget every counter of a client, locally and in the shared store
    pub async fn reset_key(&self, client_id: &str) {
        let type_prefix = format!("{}:", client_id);
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|key, _| key != client_id && !key.starts_with(&type_prefix));
        }

        if !self.store.is_enabled() {
            return;
        }

        if let Err(e) = self.store.delete(&store_key(client_id)).await {
            warn!(client_id, error = %e, "Failed to delete shared rate limit key");
            metrics::rate_limit_store_error("delete");
        }

        match self.store.keys_matching(&store_key(&type_prefix)).await {
            Ok(keys) => {
                let results = join_all(keys.iter().map(|k| self.store.delete(k))).await;
                for (key, result) in keys.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(key = %key, error = %e, "Failed to delete shared rate limit key");
                        metrics::rate_limit_store_error("delete");
                    }
                }
            }
            Err(e) => {
                warn!(client_id, error = %e, "Failed to list shared rate limit keys");
                metrics::rate_limit_store_error("keys_matching");
            }
        }
        info!(client_id, "Rate limit counters reset");
    }

    /// Flush expired windows and evict entries idle for a further window
    pub async fn cleanup(&self) -> CleanupStats {
        let now_ms = match self.clock.now_ms() {
            Ok(now) => now,
            Err(e) => {
                error!(error = %e, "Rate limit cleanup skipped");
                return CleanupStats::default();
            }
        };

        let slots: Vec<(String, Slot)> =
            self.entries.lock().await.iter().map(|(k, s)| (k.clone(), s.clone())).collect();

        let mut stats = CleanupStats::default();
        let mut stale = Vec::new();
        for (key, slot) in slots {
            let mut entry = slot.lock().await;
            if !entry.initialized || !entry.is_expired(now_ms) {
                continue;
            }

            if entry.pending > 0 && self.store.is_enabled() {
                let delta = std::mem::take(&mut entry.pending);
                let bucket = entry.bucket_second(now_ms);
                match self.write_back(&key, bucket, delta, entry.window_ms).await {
                    Ok(()) => {
                        entry.last_synced_count = entry.count;
                        stats.flushed += 1;
                    }
                    Err(e) => {
                        entry.pending += delta;
                        error!(key = %key, error = %e, "Failed to flush expired rate limit entry");
                    }
                }
            }

            if now_ms >= entry.window_end_ms() + entry.window_ms {
                stale.push((key, slot.clone()));
            }
        }

        let mut entries = self.entries.lock().await;
        for (key, slot) in stale {
            if !entries.get(&key).map_or(false, |current| Arc::ptr_eq(current, &slot)) {
                continue;
            }
            // A concurrent check holding the entry keeps it alive
            let Ok(mut entry) = slot.try_lock() else {
                continue;
            };
            if entry.is_expired(now_ms) && now_ms >= entry.window_end_ms() + entry.window_ms {
                entry.evicted = true;
                entries.remove(&key);
                stats.evicted += 1;
            }
        }
        metrics::set_rate_limit_tracked_keys(entries.len());

        if stats.flushed > 0 || stats.evicted > 0 {
            debug!(flushed = stats.flushed, evicted = stats.evicted, "Rate limit cleanup finished");
        }
        stats
    }

    /// Write every pending delta to the shared store
    pub async fn force_sync(&self) -> SyncStats {
        if !self.store.is_enabled() {
            return SyncStats::default();
        }
        let now_ms = match self.clock.now_ms() {
            Ok(now) => now,
            Err(e) => {
                error!(error = %e, "Rate limit force sync skipped");
                return SyncStats::default();
            }
        };

        let slots: Vec<(String, Slot)> =
            self.entries.lock().await.iter().map(|(k, s)| (k.clone(), s.clone())).collect();

        let outcomes = join_all(slots.into_iter().map(|(key, slot)| async move {
            let mut entry = slot.lock().await;
            if entry.pending == 0 {
                return None;
            }
            let delta = std::mem::take(&mut entry.pending);
            let bucket = entry.bucket_second(now_ms);
            match self.write_back(&key, bucket, delta, entry.window_ms).await {
                Ok(()) => {
                    entry.last_synced_count = entry.count;
                    Some(true)
                }
                Err(e) => {
                    entry.pending += delta;
                    error!(key = %key, error = %e, "Force sync of rate limit counter failed");
                    Some(false)
                }
            }
        }))
        .await;

        let mut stats = SyncStats::default();
        for outcome in outcomes.into_iter().flatten() {
            if outcome {
                stats.synced += 1;
            } else {
                stats.failed += 1;
            }
        }
        if stats.synced > 0 || stats.failed > 0 {
            debug!(synced = stats.synced, failed = stats.failed, "Forced rate limit sync finished");
        }
        stats
    }

    /// Spawn the cleanup and force-sync loops under `coordinator`
    pub async fn start(self: &Arc<Self>, coordinator: &ShutdownCoordinator) {
        let tracker = Arc::clone(self);
        let cleanup_every = self.config.window;
        coordinator
            .spawn("rate-limit-cleanup", async move {
                let mut ticker = tokio::time::interval(cleanup_every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    tracker.cleanup().await;
                }
            })
            .await;

        let tracker = Arc::clone(self);
        let sync_every = self.config.force_sync_interval;
        coordinator
            .spawn("rate-limit-force-sync", async move {
                let mut ticker = tokio::time::interval(sync_every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    tracker.force_sync().await;
                }
            })
            .await;

        info!(
            cleanup_interval = ?cleanup_every,
            force_sync_interval = ?sync_every,
            "Rate limit background tasks started"
        );
    }

    /// Flush all pending counts and drop local state
    pub async fn shutdown(&self) {
        let stats = self.force_sync().await;
        self.entries.lock().await.clear();
        info!(synced = stats.synced, failed = stats.failed, "Rate limit tracker shut down");
    }

    pub async fn tracked_keys(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Current state of the global counter of a client
    pub async fn snapshot(&self, client_id: &str) -> Option<EntrySnapshot> {
        self.snapshot_key(client_id).await
    }

    /// Current state of a client's per-type counter
    pub async fn snapshot_type(&self, client_id: &str, message_type: &str) -> Option<EntrySnapshot> {
        self.snapshot_key(&type_key(client_id, message_type)).await
    }

    async fn snapshot_key(&self, key: &str) -> Option<EntrySnapshot> {
        let slot = self.existing_slot(key).await?;
        let entry = slot.lock().await;
        entry.initialized.then(|| entry.snapshot())
    }
}

async fn write_back(
    store: &dyn SharedCounterStore,
    key: &str,
    bucket_sec: u64,
    delta: u64,
    ttl: Duration,
) -> Result<(), CounterStoreError> {
    let store_key = store_key(key);
    store.hash_increment(&store_key, &bucket_sec.to_string(), delta).await?;
    store.expire(&store_key, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core_ratelimit::store::{DisabledCounterStore, InMemoryCounterStore};
    use crate::test_utils::FailingCounterStore;

    const START_MS: u64 = 1_700_000_000_000;

    fn config(sync_threshold: u64) -> RateLimitConfig {
        RateLimitConfig { sync_threshold, ..Default::default() }
    }

    fn policy(max_requests: u64, per_type: u64, window_secs: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests,
            message_type_limit: Some(per_type),
            window: Duration::from_secs(window_secs),
        }
    }

    fn local_tracker(sync_threshold: u64) -> (RateLimitTracker, ManualClock) {
        let clock = ManualClock::new(START_MS);
        let tracker = RateLimitTracker::new(
            config(sync_threshold),
            Arc::new(DisabledCounterStore),
            Arc::new(clock.clone()),
        );
        (tracker, clock)
    }

    fn shared_tracker(sync_threshold: u64) -> (RateLimitTracker, Arc<InMemoryCounterStore>, ManualClock) {
        let clock = ManualClock::new(START_MS);
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone())));
        let tracker = RateLimitTracker::new(config(sync_threshold), store.clone(), Arc::new(clock.clone()));
        (tracker, store, clock)
    }

    #[tokio::test]
    async fn test_limit_is_reached_on_the_max_th_hit() {
        let (tracker, _) = local_tracker(1_000);
        let p = policy(3, 100, 60);

        assert!(!tracker.check("c1", None, &p).await.is_limited);
        assert!(!tracker.check("c1", None, &p).await.is_limited);

        let third = tracker.check("c1", None, &p).await;
        assert!(third.is_limited);
        assert_eq!(third.reason, Some(LimitReason::Global));
        assert_eq!(third.total_hits, 3);
        assert_eq!(third.reset_time_ms, START_MS + 60_000);
    }

    #[tokio::test]
    async fn test_message_type_limit() {
        let (tracker, _) = local_tracker(1_000);
        let p = policy(100, 2, 60);

        assert!(!tracker.check("c1", Some("ping"), &p).await.is_limited);
        let second = tracker.check("c1", Some("ping"), &p).await;
        assert!(second.is_limited);
        assert_eq!(second.reason, Some(LimitReason::MessageType("ping".to_string())));
        assert_eq!(second.reason.unwrap().to_string(), "message_type:ping");

        // Other types are counted separately
        assert!(!tracker.check("c1", Some("register"), &p).await.is_limited);
    }

    #[tokio::test]
    async fn test_global_limit_skips_type_counter() {
        let (tracker, _) = local_tracker(1_000);
        let p = policy(1, 10, 60);

        let decision = tracker.check("c1", Some("ping"), &p).await;
        assert_eq!(decision.reason, Some(LimitReason::Global));
        assert!(tracker.snapshot_type("c1", "ping").await.is_none());
    }

    #[tokio::test]
    async fn test_window_rollover_resets_count() {
        let (tracker, clock) = local_tracker(1_000);
        let p = policy(2, 10, 60);

        tracker.check("c1", None, &p).await;
        assert!(tracker.check("c1", None, &p).await.is_limited);

        clock.advance(Duration::from_secs(59));
        assert!(tracker.check("c1", None, &p).await.is_limited);

        clock.advance(Duration::from_secs(1));
        let fresh = tracker.check("c1", None, &p).await;
        assert!(!fresh.is_limited);
        assert_eq!(fresh.total_hits, 1);
        assert_eq!(fresh.reset_time_ms, START_MS + 120_000);
    }

    #[tokio::test]
    async fn test_decrement_never_goes_negative() {
        let (tracker, _) = local_tracker(1_000);
        let p = policy(10, 10, 60);

        tracker.check("c1", Some("ping"), &p).await;
        tracker.decrement("c1", Some("ping")).await;
        tracker.decrement("c1", Some("ping")).await;

        assert_eq!(tracker.snapshot("c1").await.unwrap().count, 0);
        assert_eq!(tracker.snapshot_type("c1", "ping").await.unwrap().count, 0);

        // Unknown keys are ignored
        tracker.decrement("nobody", None).await;
        assert!(tracker.snapshot("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_seed_from_shared_store() {
        let (tracker, store, _) = shared_tracker(1_000);
        let now_sec = START_MS / 1000;
        store.hash_set("ratelimit:c1", &(now_sec - 10).to_string(), 4).await.unwrap();
        store.hash_set("ratelimit:c1", &(now_sec - 30).to_string(), 3).await.unwrap();
        // Outside the trailing window
        store.hash_set("ratelimit:c1", &(now_sec - 61).to_string(), 50).await.unwrap();

        let decision = tracker.check("c1", None, &policy(100, 20, 60)).await;
        assert_eq!(decision.total_hits, 8);
        assert_eq!(tracker.snapshot("c1").await.unwrap().last_synced_count, 7);
    }

    #[tokio::test]
    async fn test_threshold_triggers_write_back() {
        let (tracker, store, _) = shared_tracker(3);
        let p = policy(100, 20, 60);

        for _ in 0..3 {
            tracker.check("c1", None, &p).await;
        }

        // Background write-back
        for _ in 0..50 {
            if store.total("ratelimit:c1").await == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.total("ratelimit:c1").await, 3);
        assert_eq!(tracker.snapshot("c1").await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_pending() {
        let clock = ManualClock::new(START_MS);
        let tracker = RateLimitTracker::new(
            config(2),
            Arc::new(FailingCounterStore::default()),
            Arc::new(clock.clone()),
        );
        let p = policy(100, 20, 60);

        tracker.check("c1", None, &p).await;
        tracker.check("c1", None, &p).await;

        for _ in 0..50 {
            if tracker.snapshot("c1").await.unwrap().pending == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.snapshot("c1").await.unwrap().pending, 2);

        let stats = tracker.force_sync().await;
        assert_eq!(stats, SyncStats { synced: 0, failed: 1 });
        assert_eq!(tracker.snapshot("c1").await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_failing_store_still_counts_locally() {
        let clock = ManualClock::new(START_MS);
        let tracker = RateLimitTracker::new(
            config(1_000),
            Arc::new(FailingCounterStore::default()),
            Arc::new(clock.clone()),
        );
        let p = policy(2, 20, 60);

        assert!(!tracker.check("c1", None, &p).await.is_limited);
        assert!(tracker.check("c1", None, &p).await.is_limited);
    }

    #[tokio::test]
    async fn test_rollover_flushes_without_double_counting() {
        let (tracker, store, clock) = shared_tracker(1_000);
        let p = policy(100, 20, 60);

        for _ in 0..5 {
            tracker.check("c1", None, &p).await;
        }
        clock.advance(Duration::from_secs(60));

        let decision = tracker.check("c1", None, &p).await;
        // Old window flushed to the store but not re-counted locally
        assert_eq!(store.total("ratelimit:c1").await, 5);
        assert_eq!(decision.total_hits, 1);
    }

    #[tokio::test]
    async fn test_force_sync_writes_all_pending() {
        let (tracker, store, _) = shared_tracker(1_000);
        let p = policy(100, 20, 60);

        tracker.check("c1", Some("ping"), &p).await;
        tracker.check("c2", None, &p).await;
        tracker.check("c2", None, &p).await;

        let stats = tracker.force_sync().await;
        assert_eq!(stats.synced, 3);
        assert_eq!(store.total("ratelimit:c1").await, 1);
        assert_eq!(store.total("ratelimit:c1:ping").await, 1);
        assert_eq!(store.total("ratelimit:c2").await, 2);

        // Nothing left to write
        assert_eq!(tracker.force_sync().await, SyncStats::default());
    }

    #[tokio::test]
    async fn test_reset_key_clears_local_and_shared() {
        let (tracker, store, _) = shared_tracker(1_000);
        let p = policy(100, 20, 60);

        tracker.check("c1", Some("ping"), &p).await;
        tracker.check("c1", Some("register"), &p).await;
        tracker.check("c10", None, &p).await;
        tracker.force_sync().await;

        tracker.reset_key("c1").await;

        assert!(tracker.snapshot("c1").await.is_none());
        assert!(tracker.snapshot_type("c1", "ping").await.is_none());
        assert!(tracker.snapshot("c10").await.is_some());
        assert_eq!(store.total("ratelimit:c1").await, 0);
        assert_eq!(store.total("ratelimit:c1:ping").await, 0);
        assert_eq!(store.total("ratelimit:c10").await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_flushes_then_evicts() {
        let (tracker, store, clock) = shared_tracker(1_000);
        let p = policy(100, 20, 60);

        tracker.check("c1", None, &p).await;
        tracker.check("c1", None, &p).await;

        clock.advance(Duration::from_secs(61));
        let first = tracker.cleanup().await;
        assert_eq!(first, CleanupStats { flushed: 1, evicted: 0 });
        assert_eq!(store.total("ratelimit:c1").await, 2);
        assert_eq!(tracker.tracked_keys().await, 1);

        clock.advance(Duration::from_secs(60));
        let second = tracker.cleanup().await;
        assert_eq!(second, CleanupStats { flushed: 0, evicted: 1 });
        assert_eq!(tracker.tracked_keys().await, 0);
    }

    #[tokio::test]
    async fn test_hit_on_evicted_slot_moves_to_fresh_entry() {
        let (tracker, clock) = local_tracker(1_000);
        let p = policy(100, 20, 60);
        tracker.check("c1", None, &p).await;

        clock.advance(Duration::from_secs(121));
        // Looked up by a check that has not locked it yet
        let looked_up = tracker.slot("c1").await;
        assert_eq!(tracker.cleanup().await.evicted, 1);
        assert!(looked_up.lock().await.evicted);

        let now_ms = START_MS + 121_000;
        assert!(tracker.hit_slot("c1", looked_up.clone(), 60_000, now_ms).await.is_none());

        let decision = tracker.check("c1", None, &p).await;
        assert_eq!(decision.total_hits, 1);
        assert_eq!(tracker.tracked_keys().await, 1);
        let current = tracker.existing_slot("c1").await.unwrap();
        assert!(!Arc::ptr_eq(&current, &looked_up));
        assert_eq!(current.lock().await.count, 1);
    }

    #[tokio::test]
    async fn test_zero_policy_window_falls_back_to_default() {
        let (tracker, _) = local_tracker(1_000);
        let p = RateLimitPolicy { max_requests: 3, message_type_limit: None, window: Duration::ZERO };

        assert!(!tracker.check("c1", None, &p).await.is_limited);
        assert!(!tracker.check("c1", None, &p).await.is_limited);
        let third = tracker.check("c1", None, &p).await;
        assert!(third.is_limited);
        assert_eq!(third.total_hits, 3);
        assert_eq!(third.reset_time_ms, START_MS + 60_000);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_clears() {
        let (tracker, store, _) = shared_tracker(1_000);
        tracker.check_default("c1", Some("ping")).await;

        tracker.shutdown().await;

        assert_eq!(tracker.tracked_keys().await, 0);
        assert_eq!(store.total("ratelimit:c1").await, 1);
        assert_eq!(store.total("ratelimit:c1:ping").await, 1);
    }

    #[tokio::test]
    async fn test_empty_message_type_is_ignored() {
        let (tracker, _) = local_tracker(1_000);
        tracker.check("c1", Some(""), &policy(10, 1, 60)).await;
        assert!(tracker.snapshot_type("c1", "").await.is_none());
    }
}
