//! Per-client rate limiting with eventually consistent shared counters

mod store;
mod tracker;

pub use store::{CounterStoreError, DisabledCounterStore, InMemoryCounterStore, SharedCounterStore};
pub use tracker::{
    CleanupStats, EntrySnapshot, LimitReason, RateLimitDecision, RateLimitPolicy, RateLimitTracker,
    SyncStats,
};
