//! Cache namespaces ("groups") and the process-wide group registry.
//!
//! A group ties together one local cache, one retriever, an optional peer
//! picker, and a single-flight group. The load path on a miss is:
//! single-flight → owning peer (if any) → local retrieval → populate.
//!
//! Groups are unique by name in a process-wide registry so the RPC server can
//! dispatch inbound `Get(group, key)` requests by name alone.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::byteview::ByteView;
use crate::cache::LocalCache;
use crate::error::CacheError;
use crate::metrics::{Metrics, Operation};
use crate::peers::PeerPicker;
use crate::singleflight::{FlightGroup, DEFAULT_TTL};

/// Loads the authoritative value for a key from the backing store.
///
/// Implementations must return [`CacheError::NotFound`] for absent keys so
/// the group can negative-cache them; any other error is surfaced uncached.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Adapts a plain function into a [`Retriever`].
pub struct RetrieverFn<F>(pub F);

#[async_trait]
impl<F> Retriever for RetrieverFn<F>
where
    F: Fn(&str) -> Result<Vec<u8>, CacheError> + Send + Sync,
{
    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        (self.0)(key)
    }
}

pub struct Group {
    name: Arc<str>,
    cache: Arc<LocalCache>,
    retriever: Arc<dyn Retriever>,
    server: OnceLock<Arc<dyn PeerPicker>>,
    flight: FlightGroup,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn registry() -> &'static RwLock<FxHashMap<String, Arc<Group>>> {
    static GROUPS: OnceLock<RwLock<FxHashMap<String, Arc<Group>>>> = OnceLock::new();
    GROUPS.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Creates (or returns the existing) group `name`.
///
/// Creation is idempotent by name: a second call with the same name returns
/// the group built by the first, regardless of the other arguments.
pub fn new_group(
    name: &str,
    strategy: &str,
    max_bytes: u64,
    retriever: Arc<dyn Retriever>,
) -> Result<Arc<Group>, CacheError> {
    new_group_with_ttl(name, strategy, max_bytes, retriever, DEFAULT_TTL)
}

/// [`new_group`] with an explicit single-flight memoization TTL.
pub fn new_group_with_ttl(
    name: &str,
    strategy: &str,
    max_bytes: u64,
    retriever: Arc<dyn Retriever>,
    flight_ttl: Duration,
) -> Result<Arc<Group>, CacheError> {
    if let Some(group) = get_group(name) {
        return Ok(group);
    }

    let mut groups = registry().write();
    if let Some(group) = groups.get(name) {
        return Ok(group.clone());
    }

    let cache = LocalCache::new(strategy, max_bytes)?;
    let group = Arc::new(Group {
        name: Arc::from(name),
        cache: Arc::new(cache),
        retriever,
        server: OnceLock::new(),
        flight: FlightGroup::new(flight_ttl),
    });
    groups.insert(name.to_string(), group.clone());
    info!(group = name, strategy, max_bytes, "group created");
    Ok(group)
}

/// Looks up a group by name.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    registry().read().get(name).cloned()
}

/// Removes a group: shuts down its server (if any), stops its single-flight
/// sweeper, and drops it from the registry.
pub async fn destroy_group(name: &str) {
    let group = registry().write().remove(name);
    if let Some(group) = group {
        if let Some(picker) = group.server.get() {
            picker.shutdown().await;
        }
        group.flight.stop();
        info!(group = name, "group destroyed");
    }
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's local cache, exposed for inspection.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Attaches the peer picker. May be called at most once per group.
    pub fn register_server(&self, picker: Arc<dyn PeerPicker>) -> Result<(), CacheError> {
        self.server
            .set(picker)
            .map_err(|_| CacheError::ServerAlreadyRegistered(self.name.to_string()))
    }

    /// Retrieves the value for `key`, consulting in order: the local cache,
    /// the owning peer (when a picker is registered and the owner is not this
    /// node), and finally the local retriever.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        self.get_inner(key, true).await
    }

    /// Local-only retrieval for requests a peer already forwarded here.
    ///
    /// Skips the picker entirely: even if this node's ring view disagrees
    /// about ownership, a redirected request is answered from the local path,
    /// so divergent views can never forward in a loop.
    pub async fn get_redirected(&self, key: &str) -> Result<ByteView, CacheError> {
        self.get_inner(key, false).await
    }

    async fn get_inner(&self, key: &str, allow_peer: bool) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        Metrics::global().record_request();

        if let Some(view) = self.cache.get(key) {
            if view.is_empty() {
                // negative-cache tombstone
                debug!(group = %self.name, key, "negative cache hit");
                return Err(CacheError::NotFound(key.to_string()));
            }
            debug!(group = %self.name, key, "cache hit");
            return Ok(view);
        }

        self.load(key, allow_peer).await
    }

    /// Runs the loader under single-flight so a thundering herd on one key
    /// costs one peer fetch or one backing-store call.
    async fn load(&self, key: &str, allow_peer: bool) -> Result<ByteView, CacheError> {
        let name = self.name.clone();
        let cache = self.cache.clone();
        let retriever = self.retriever.clone();
        let picker = if allow_peer {
            self.server.get().cloned()
        } else {
            None
        };
        let owned = key.to_string();

        self.flight
            .do_call(key, move || async move {
                if let Some(picker) = picker {
                    if let Some(fetcher) = picker.pick(&owned) {
                        match fetcher.fetch(&name, &owned).await {
                            Ok(bytes) if !bytes.is_empty() => {
                                return Ok(ByteView::from(bytes));
                            }
                            Ok(_) => {
                                warn!(group = %name, key = %owned, "peer returned empty value, falling back to local retrieval");
                            }
                            Err(err) => {
                                warn!(group = %name, key = %owned, %err, "failed to get from peer, falling back to local retrieval");
                            }
                        }
                    }
                }
                retrieve_locally(&name, &cache, retriever.as_ref(), &owned).await
            })
            .await
    }
}

/// Loads from the backing store and populates the cache.
///
/// A `NotFound` result populates an empty tombstone so repeated lookups of an
/// absent key cannot hammer the backing store (anti-penetration); other
/// retriever errors are surfaced without caching anything.
async fn retrieve_locally(
    name: &str,
    cache: &LocalCache,
    retriever: &dyn Retriever,
    key: &str,
) -> Result<ByteView, CacheError> {
    let metrics = Metrics::global();
    let start = Instant::now();
    let result = retriever.retrieve(key).await;
    metrics.observe_duration(Operation::Put, start.elapsed());

    match result {
        Ok(bytes) if bytes.is_empty() => {
            // an empty authoritative value is indistinguishable from absence
            metrics.record_backing_store_miss();
            info!(group = name, key, "caching empty result for absent key");
            cache.put(key, ByteView::default());
            Err(CacheError::NotFound(key.to_string()))
        }
        Ok(bytes) => {
            metrics.record_backing_store_hit();
            let view = ByteView::from(bytes);
            cache.put(key, view.clone());
            Ok(view)
        }
        Err(err) => {
            metrics.record_backing_store_miss();
            if err.is_not_found() {
                info!(group = name, key, "caching empty result for absent key");
                cache.put(key, ByteView::default());
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_retriever(
        hit_key: &'static str,
        value: &'static [u8],
        calls: Arc<AtomicUsize>,
    ) -> Arc<dyn Retriever> {
        Arc::new(RetrieverFn(move |key: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            if key == hit_key {
                Ok(value.to_vec())
            } else {
                Err(CacheError::NotFound(key.to_string()))
            }
        }))
    }

    #[tokio::test]
    async fn creation_is_idempotent_by_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retriever = counting_retriever("k", b"v", calls);
        let first = new_group("grp-idempotent", "lru", 1024, retriever.clone()).unwrap();
        let second = new_group("grp-idempotent", "fifo", 4096, retriever).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        destroy_group("grp-idempotent").await;
    }

    #[tokio::test]
    async fn creation_rejects_bad_config() {
        let retriever = counting_retriever("k", b"v", Arc::new(AtomicUsize::new(0)));
        assert_eq!(
            new_group("grp-bad-size", "lru", 0, retriever.clone()).unwrap_err(),
            CacheError::InvalidCacheSize(0)
        );
        assert_eq!(
            new_group("grp-bad-strategy", "mru", 1024, retriever).unwrap_err(),
            CacheError::UnknownStrategy("mru".into())
        );
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let retriever = counting_retriever("k", b"v", Arc::new(AtomicUsize::new(0)));
        let group = new_group("grp-empty-key", "lru", 1024, retriever).unwrap();
        assert_eq!(group.get("").await.unwrap_err(), CacheError::EmptyKey);
        destroy_group("grp-empty-key").await;
    }

    #[tokio::test]
    async fn cold_miss_loads_then_warm_hit_skips_retriever() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = new_group(
            "grp-cold-warm",
            "lru",
            1024,
            counting_retriever("CNF-001", b"X", calls.clone()),
        )
        .unwrap();

        assert_eq!(group.get("CNF-001").await.unwrap(), ByteView::new(b"X"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(group.get("CNF-001").await.unwrap(), ByteView::new(b"X"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        destroy_group("grp-cold-warm").await;
    }

    #[tokio::test]
    async fn not_found_is_negative_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = new_group(
            "grp-negative",
            "lru",
            1024,
            counting_retriever("present", b"v", calls.clone()),
        )
        .unwrap();

        for _ in 0..3 {
            let err = group.get("absent").await.unwrap_err();
            assert_eq!(err, CacheError::NotFound("absent".into()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        destroy_group("grp-negative").await;
    }

    #[tokio::test]
    async fn retriever_error_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        let group = new_group_with_ttl(
            "grp-retriever-error",
            "lru",
            1024,
            Arc::new(RetrieverFn(move |key: &str| {
                inner.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::Retriever {
                    key: key.to_string(),
                    message: "db down".into(),
                })
            })),
            Duration::from_millis(20),
        )
        .unwrap();

        assert!(matches!(
            group.get("k").await.unwrap_err(),
            CacheError::Retriever { .. }
        ));
        // past the flight memo, the error is retried against the store
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(group.get("k").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(group.cache().len(), 0);
        destroy_group("grp-retriever-error").await;
    }

    #[tokio::test]
    async fn eviction_under_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        let group = new_group(
            "grp-eviction",
            "lru",
            20,
            Arc::new(RetrieverFn(move |_key: &str| {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(b"0123456789".to_vec())
            })),
        )
        .unwrap();

        group.get("a").await.unwrap();
        group.get("b").await.unwrap(); // evicts "a" (11 + 11 > 20)
        assert!(group.cache().bytes() <= 20);
        assert_eq!(group.cache().len(), 1);
        destroy_group("grp-eviction").await;
    }

    #[tokio::test]
    async fn concurrent_cold_gets_collapse_to_one_retrieval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        let group = new_group(
            "grp-collapse",
            "lru",
            1024,
            Arc::new(RetrieverFn(move |_key: &str| {
                inner.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                Ok(b"v".to_vec())
            })),
        )
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let group = group.clone();
            handles.push(tokio::spawn(async move { group.get("k").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), ByteView::new(b"v"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        destroy_group("grp-collapse").await;
    }

    #[tokio::test]
    async fn register_server_only_once() {
        struct NoopPicker;
        #[async_trait]
        impl PeerPicker for NoopPicker {
            fn pick(&self, _key: &str) -> Option<Arc<dyn crate::peers::Fetcher>> {
                None
            }
        }

        let retriever = counting_retriever("k", b"v", Arc::new(AtomicUsize::new(0)));
        let group = new_group("grp-register", "lru", 1024, retriever).unwrap();
        group.register_server(Arc::new(NoopPicker)).unwrap();
        assert_eq!(
            group.register_server(Arc::new(NoopPicker)).unwrap_err(),
            CacheError::ServerAlreadyRegistered("grp-register".into())
        );
        destroy_group("grp-register").await;
    }

    #[tokio::test]
    async fn destroy_group_removes_from_registry() {
        let retriever = counting_retriever("k", b"v", Arc::new(AtomicUsize::new(0)));
        new_group("grp-destroy", "lru", 1024, retriever).unwrap();
        assert!(get_group("grp-destroy").is_some());
        destroy_group("grp-destroy").await;
        assert!(get_group("grp-destroy").is_none());
    }
}
