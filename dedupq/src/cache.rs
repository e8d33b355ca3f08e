//! Capacity-bounded TTL cache with sweep-based eviction.
//!
//! Entries leave the cache in exactly two ways: the background sweeper
//! removes everything whose expiry has passed, or a caller uncaches them.
//! A full cache rejects inserts; it never evicts to make room.
//!
//! `TtlCache<()>` is the key-only form used for dedup bookkeeping;
//! `TtlCache<V>` additionally carries a value per key.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheOptions, DEFAULT_SCAN_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("this key already exists")]
    AlreadyExists,
    #[error("could not insert, the cache is full")]
    CacheFull,
}

struct Entry<V> {
    expires_at: Instant,
    value: V,
}

struct Inner<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    max_records: usize,
}

impl<V> Inner<V> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::error!("Cache lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("Cache lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

/// Capacity-bounded mapping from key to expiry, optionally carrying a value.
///
/// Must be created inside a tokio runtime: construction spawns the sweeper,
/// which runs until the parent token fires, [`TtlCache::shutdown`] is called,
/// or the cache is dropped.
pub struct TtlCache<V = ()> {
    inner: Arc<Inner<V>>,
    cancel: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_records` entries (clamped to 1).
    pub fn new(max_records: usize, options: CacheOptions, parent: &CancellationToken) -> Self {
        let scan_rate = if options.scan_rate.is_zero() {
            tracing::warn!("Cache scan_rate of zero replaced with the default");
            DEFAULT_SCAN_RATE
        } else {
            options.scan_rate
        };

        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
        });
        let cancel = parent.child_token();
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&inner), scan_rate, cancel.clone()));

        Self {
            inner,
            cancel,
            sweeper: StdMutex::new(Some(sweeper)),
        }
    }

    /// Insert or refresh a value. A live key is overwritten in place and does
    /// not count against capacity; a fresh key is rejected when full.
    pub fn insert_value(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = key.into();
        let entry = Entry {
            expires_at: Instant::now() + ttl,
            value,
        };

        let mut entries = self.inner.write();
        if let Some(existing) = entries.get_mut(&key) {
            *existing = entry;
            return Ok(());
        }
        if entries.len() >= self.inner.max_records {
            return Err(CacheError::CacheFull);
        }
        entries.insert(key, entry);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().get(key).map(|entry| entry.value.clone())
    }

    pub fn check(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Remove a key before it expires. Returns whether it was present.
    pub fn uncache(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Remove several keys under one lock. Returns how many were present.
    pub fn uncache_many<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.inner.write();
        keys.into_iter()
            .filter(|key| entries.remove(key.as_ref()).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_records
    }

    /// Run one sweep now. Returns how many entries were evicted.
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Cache sweeper did not exit cleanly");
        }
    }
}

impl TtlCache<()> {
    /// Insert a key that expires after `ttl`.
    ///
    /// Capacity is checked first, so a full cache reports `CacheFull` even for
    /// a key it already holds.
    pub fn insert(&self, key: impl Into<String>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.inner.write();
        if entries.len() >= self.inner.max_records {
            return Err(CacheError::CacheFull);
        }
        match entries.entry(key.into()) {
            MapEntry::Occupied(_) => Err(CacheError::AlreadyExists),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    expires_at,
                    value: (),
                });
                Ok(())
            }
        }
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep_loop<V>(inner: Arc<Inner<V>>, scan_rate: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + scan_rate, scan_rate);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = inner.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "Swept expired cache entries");
                }
            }
        }
    }
    tracing::trace!("Cache sweeper exiting");
}
