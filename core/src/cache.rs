//! Result cache: memoizes dataset builds keyed by query fingerprint.
//!
//! This is the "shield the backing store" layer: many concurrent
//! consumers asking for the same slice must cost one build, not N.
//! A per-fingerprint async lock guarantees at most one in-flight build
//! per fingerprint; waiters re-check the cache after acquiring the
//! lock and hit the first builder's result. Entries are evicted
//! least-recently-used when the byte or entry budget is exceeded, and
//! are considered stale when either the staleness window elapses or
//! the index version has moved past the version they were built at.
//!
//! The cache never writes back to the index store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dqmflow_protocol::{Dataset, DatasetQuery};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dataset::DatasetBuilder;
use crate::error::Result;
use crate::index::store::IndexStore;

struct CacheSlot {
    dataset: Arc<Dataset>,
    built_at: Instant,
    last_access: Instant,
    size_bytes: usize,
    index_version: u64,
}

/// Counters for operator visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
}

pub struct ResultCache {
    store: IndexStore,
    builder: DatasetBuilder,
    entries: Mutex<HashMap<String, CacheSlot>>,
    /// Per-fingerprint build locks; the entry is dropped once no
    /// builder or waiter holds it.
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_bytes: usize,
    max_entries: usize,
    staleness: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(
        store: IndexStore,
        builder: DatasetBuilder,
        max_bytes: usize,
        max_entries: usize,
        staleness: Duration,
    ) -> ResultCache {
        ResultCache {
            store,
            builder,
            entries: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            max_bytes,
            max_entries: max_entries.max(1),
            staleness,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the cached dataset for `query`, building it if absent or
    /// stale.
    ///
    /// A cancelled build releases the fingerprint lock without
    /// populating the cache; other fingerprints are never blocked.
    pub async fn get_or_build(
        &self,
        query: &DatasetQuery,
        token: &CancellationToken,
    ) -> Result<Arc<Dataset>> {
        let fingerprint = query.fingerprint();
        let current_version = self.store.version_async().await?;

        if let Some(dataset) = self.lookup(&fingerprint, current_version).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(dataset);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let lock = self.build_lock(&fingerprint).await;
        let result = {
            let _guard = lock.lock().await;
            self.build_under_lock(&fingerprint, query, token).await
        };
        self.release_build_lock(&fingerprint, lock).await;
        result
    }

    /// Caller holds the fingerprint's build lock.
    async fn build_under_lock(
        &self,
        fingerprint: &str,
        query: &DatasetQuery,
        token: &CancellationToken,
    ) -> Result<Arc<Dataset>> {
        // Re-check: a concurrent caller may have finished the build
        // while we waited for the lock.
        let current_version = self.store.version_async().await?;
        if let Some(dataset) = self.lookup(fingerprint, current_version).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(dataset);
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint, "building dataset");
        let dataset = Arc::new(self.builder.build(query, token).await?);
        self.insert(fingerprint, Arc::clone(&dataset)).await;
        Ok(dataset)
    }

    /// Drop all cached entries.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        CacheStats {
            entries: entries.len(),
            size_bytes: entries.values().map(|s| s.size_bytes).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, fingerprint: &str, current_version: u64) -> Option<Arc<Dataset>> {
        let mut entries = self.entries.lock().await;
        let slot = entries.get_mut(fingerprint)?;
        if slot.built_at.elapsed() > self.staleness {
            tracing::debug!(fingerprint, "cache entry past staleness window");
            entries.remove(fingerprint);
            return None;
        }
        if slot.index_version != current_version {
            tracing::debug!(
                fingerprint,
                built_version = slot.index_version,
                current_version,
                "cache entry invalidated by index growth"
            );
            entries.remove(fingerprint);
            return None;
        }
        slot.last_access = Instant::now();
        Some(Arc::clone(&slot.dataset))
    }

    async fn insert(&self, fingerprint: &str, dataset: Arc<Dataset>) {
        let size_bytes = dataset.approx_size_bytes();
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            fingerprint.to_string(),
            CacheSlot {
                index_version: dataset.index_version,
                dataset,
                built_at: now,
                last_access: now,
                size_bytes,
            },
        );

        // Evict LRU until within budget; the entry just inserted is
        // kept even if it alone exceeds the byte budget.
        loop {
            let total: usize = entries.values().map(|s| s.size_bytes).sum();
            if entries.len() <= self.max_entries && total <= self.max_bytes {
                break;
            }
            let victim = entries
                .iter()
                .filter(|(k, _)| k.as_str() != fingerprint)
                .min_by_key(|(_, s)| s.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(fingerprint = %key, "evicted LRU cache entry");
                }
                None => break,
            }
        }
    }

    async fn build_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        Arc::clone(
            locks
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn release_build_lock(&self, fingerprint: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.build_locks.lock().await;
        drop(lock);
        // Drop the map entry when no waiter holds a clone; checked
        // under the map lock so no new clone can race the removal.
        if let Some(existing) = locks.get(fingerprint)
            && Arc::strong_count(existing) == 1
        {
            locks.remove(fingerprint);
        }
    }
}
