//! In-process counter store.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use super::store::{CounterRecord, CounterStore};
use crate::error::StoreError;

/// Increments between opportunistic sweeps of expired records.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// A [`CounterStore`] backed by a concurrent hash map.
///
/// Expired records are dropped lazily when read, and every
/// `purge_interval` increments the whole map is swept, so keys that are
/// never touched again do not accumulate. [`purge_expired`](Self::purge_expired)
/// can also be called directly.
pub struct MemoryCounterStore {
    records: DashMap<String, CounterRecord>,
    increments: AtomicU64,
    purge_interval: u64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            increments: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    /// Sweep expired records every `interval` increments. Zero disables sweeping.
    pub fn with_purge_interval(mut self, interval: u64) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Drop every record expired at `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        before.saturating_sub(self.records.len())
    }

    /// Number of records held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn maybe_purge(&self, now: DateTime<Utc>) {
        if self.purge_interval == 0 {
            return;
        }
        let n = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.purge_interval == 0 {
            let purged = self.purge_expired(now);
            trace!(purged, "Swept expired counter records");
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    now + TimeDelta::seconds(ttl_seconds as i64)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, StoreError> {
        // Must run before the entry guard below is taken: `retain` locks every shard.
        self.maybe_purge(now);

        // The entry guard holds the shard lock, so the read-modify-write is atomic.
        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord {
                count: 0,
                expires_at: expiry(now, window_seconds),
            });

        if entry.expires_at <= now {
            *entry = CounterRecord {
                count: 0,
                expires_at: expiry(now, window_seconds),
            };
        }

        entry.count += 1;
        Ok(*entry)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError> {
        let record = self.records.get(key).map(|r| *r);

        match record {
            Some(record) if record.expires_at > now => Ok(Some(record)),
            Some(_) => {
                self.records.remove_if(key, |_, r| r.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<CounterRecord, StoreError> {
        let record = CounterRecord {
            count: value,
            expires_at: expiry(now, ttl_seconds),
        };
        self.records.insert(key.to_string(), record);
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}
