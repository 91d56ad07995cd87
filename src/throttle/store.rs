//! Counter store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// A counter value together with the instant it disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

/// Key-value store with atomic increment and TTL expiry.
///
/// The engine is the only component that talks to the store. Implementations
/// must make `increment` atomic per key: the first increment of a fresh
/// window creates the record with `count = 1` and sets its TTL, and later
/// increments within the window leave the expiry untouched.
///
/// Every call carries the engine's `now`. Expiry is always judged against it,
/// so the engine and the store can never disagree about whether a window has
/// ended.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, creating it with an expiry of
    /// `now + window_seconds` if absent or expired at `now`.
    async fn increment(
        &self,
        key: &str,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, StoreError>;

    /// Read the record at `key` if it is live at `now`.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError>;

    /// Overwrite the record at `key`, expiring at `now + ttl_seconds`.
    async fn set(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, StoreError>;

    /// Remove the record at `key`, if any.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
