//! Concurrent-safe wrapper around one eviction policy.
//!
//! `LocalCache` owns the lock the policies rely on for exclusive access and
//! feeds the metrics sink: hit/miss counters and lookup latency on `get`,
//! eviction counts through the policy callback, and the size/items gauges
//! after every mutation.

use std::fmt;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use crate::byteview::ByteView;
use crate::error::CacheError;
use crate::metrics::{Metrics, Operation};
use crate::policy::{new_policy, EvictionPolicy};

pub struct LocalCache {
    // Every policy mutates bookkeeping on get, so reads take the write half
    // too; the lock's job is exclusive access, not read parallelism.
    strategy: RwLock<Box<dyn EvictionPolicy>>,
    max_bytes: u64,
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl LocalCache {
    /// Builds a cache with the named eviction strategy and byte budget.
    pub fn new(strategy: &str, max_bytes: u64) -> Result<Self, CacheError> {
        if max_bytes == 0 {
            return Err(CacheError::InvalidCacheSize(max_bytes));
        }
        let on_evicted = Box::new(|key: &str, _value: &ByteView| {
            debug!(key, "cache entry evicted");
            Metrics::global().record_eviction();
        });
        let policy = new_policy(strategy, max_bytes, Some(on_evicted))?;
        Ok(Self {
            strategy: RwLock::new(policy),
            max_bytes,
        })
    }

    /// Looks up `key`, recording hit/miss counters and lookup latency.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let metrics = Metrics::global();
        let start = Instant::now();
        let result = self.strategy.write().get(key);
        metrics.observe_duration(Operation::Get, start.elapsed());
        match result {
            Some(view) => {
                metrics.record_hit();
                Some(view)
            }
            None => {
                metrics.record_miss();
                None
            }
        }
    }

    /// Inserts or updates `key`, evicting as needed, and refreshes gauges.
    pub fn put(&self, key: &str, value: ByteView) {
        let mut strategy = self.strategy.write();
        strategy.put(key, value);
        Metrics::global().set_cache_size(strategy.bytes());
        Metrics::global().set_item_count(strategy.len() as u64);
    }

    /// Removes `key` explicitly; returns whether it was resident.
    pub fn remove(&self, key: &str) -> bool {
        let mut strategy = self.strategy.write();
        let removed = strategy.remove(key);
        if removed {
            Metrics::global().set_cache_size(strategy.bytes());
            Metrics::global().set_item_count(strategy.len() as u64);
        }
        removed
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.strategy.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the budget.
    pub fn bytes(&self) -> u64 {
        self.strategy.read().bytes()
    }

    /// The configured byte budget.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(s: &str) -> ByteView {
        ByteView::new(s.as_bytes())
    }

    #[test]
    fn rejects_zero_budget() {
        assert_eq!(
            LocalCache::new("lru", 0).unwrap_err(),
            CacheError::InvalidCacheSize(0)
        );
    }

    #[test]
    fn rejects_unknown_strategy() {
        assert_eq!(
            LocalCache::new("clock", 1024).unwrap_err(),
            CacheError::UnknownStrategy("clock".into())
        );
    }

    #[test]
    fn get_put_roundtrip() {
        let cache = LocalCache::new("lru", 1024).unwrap();
        assert_eq!(cache.get("k"), None);
        cache.put("k", view("v"));
        assert_eq!(cache.get("k"), Some(view("v")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 2);
    }

    #[test]
    fn stays_within_budget() {
        let cache = LocalCache::new("lru", 20).unwrap();
        cache.put("a", view("0123456789"));
        cache.put("b", view("0123456789"));
        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
        assert!(cache.bytes() <= 20);
    }

    #[test]
    fn remove_reports_residency() {
        let cache = LocalCache::new("slru", 1024).unwrap();
        cache.put("k", view("v"));
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
        assert!(cache.is_empty());
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;
        let cache = Arc::new(LocalCache::new("lru", 4096).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}-k{i}");
                    cache.put(&key, ByteView::new(b"value"));
                    assert!(cache.get(&key).is_some() || cache.bytes() <= 4096);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.bytes() <= 4096);
    }
}
