//! In-memory result cache with per-entry TTL.
//!
//! ## Expiry
//!
//! Expiry is lazy: a `get` that finds a stale entry removes it and reports
//! a miss. `purge_expired` sweeps the whole map and is driven by the
//! service's maintenance task.
//!
//! Backed by a sharded `DashMap`, so readers of different companies never
//! contend and readers of the same company only share a shard read lock.

use crate::types::{CompanyQuery, CompanyResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cache entry with metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: Arc<CompanyResult>,
    /// When the entry was inserted.
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Company key → normalized result.
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh result for `query`, if any. A stale entry is removed.
    pub fn get(&self, query: &CompanyQuery) -> Option<Arc<CompanyResult>> {
        {
            let entry = self.entries.get(query.key())?;
            if !entry.is_expired() {
                return Some(Arc::clone(&entry.result));
            }
        }
        // Re-check under the shard write lock so a concurrent `put` of a
        // fresh value is not thrown away.
        if self
            .entries
            .remove_if(query.key(), |_, entry| entry.is_expired())
            .is_some()
        {
            tracing::debug!("cache entry for {} expired", query.key());
        }
        None
    }

    /// Full entry for `query` regardless of age.
    pub fn peek(&self, query: &CompanyQuery) -> Option<CacheEntry> {
        self.entries.get(query.key()).map(|entry| entry.clone())
    }

    /// Insert or replace the entry for `query`.
    pub fn put(&self, query: &CompanyQuery, result: Arc<CompanyResult>, ttl: Duration) {
        tracing::debug!("caching {} for {}s", query.key(), ttl.as_secs());
        self.entries.insert(
            query.key().to_string(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Insert with the store's default TTL.
    pub fn put_default(&self, query: &CompanyQuery, result: Arc<CompanyResult>) {
        self.put(query, result, self.default_ttl);
    }

    /// Drop one entry. Returns whether anything was removed.
    pub fn invalidate(&self, query: &CompanyQuery) -> bool {
        self.entries.remove(query.key()).is_some()
    }

    /// Drop every entry. Returns how many were removed.
    pub fn invalidate_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Remove all stale entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, including stale ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECS))
    }
}
