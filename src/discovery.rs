//! Service discovery: registration, membership listing, and the watch loop
//! that drives ring rebuilds.
//!
//! The registry itself is an external collaborator (an etcd-like KV with
//! prefix watch); only its contract lives here. Service entries use the key
//! format `"<service>/<addr>"` with the dialable address as the value, and
//! stay registered while the node is live.
//!
//! [`MemoryRegistry`] is the in-process implementation used by tests and
//! single-process clusters. [`watch_service`] is the long-running loop that
//! turns registry churn into rebuild tokens, coalescing event storms with a
//! short debounce so a burst of joins triggers one rebuild.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheError;

/// Debounce window applied before emitting a rebuild token.
const REBUILD_DEBOUNCE: Duration = Duration::from_millis(100);

/// One membership change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl RegistryEvent {
    fn key(&self) -> &str {
        match self {
            RegistryEvent::Put { key, .. } => key,
            RegistryEvent::Delete { key } => key,
        }
    }
}

/// Contract of the discovery registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Registers `"<service>/<addr>" -> addr` under a lease that lasts while
    /// the node is live; the entry disappears on `deregister` or lease expiry.
    async fn register(&self, service: &str, addr: &str) -> Result<(), CacheError>;

    /// Removes this node's entry.
    async fn deregister(&self, service: &str, addr: &str) -> Result<(), CacheError>;

    /// Lists the addresses currently registered under `service`.
    async fn list(&self, service: &str) -> Result<Vec<String>, CacheError>;

    /// Subscribes to all registry changes; callers filter by prefix.
    fn watch(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// In-process registry backed by a sorted map and a broadcast channel.
pub struct MemoryRegistry {
    entries: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, service: &str, addr: &str) -> Result<(), CacheError> {
        let key = format!("{service}/{addr}");
        self.entries.write().insert(key.clone(), addr.to_string());
        info!(%key, "service endpoint registered");
        self.emit(RegistryEvent::Put {
            key,
            value: addr.to_string(),
        });
        Ok(())
    }

    async fn deregister(&self, service: &str, addr: &str) -> Result<(), CacheError> {
        let key = format!("{service}/{addr}");
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            info!(%key, "service endpoint removed");
            self.emit(RegistryEvent::Delete { key });
        }
        Ok(())
    }

    async fn list(&self, service: &str) -> Result<Vec<String>, CacheError> {
        let prefix = format!("{service}/");
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, addr)| addr.clone())
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

/// Watches `service` and sends one token per (debounced) membership change.
///
/// The consumer reacts to a token by re-listing the service and rebuilding
/// its ring, so membership converges within seconds of a change. The loop
/// exits when the registry closes its event stream or the consumer goes away.
pub fn watch_service(
    registry: Arc<dyn ServiceRegistry>,
    service: String,
    updates: mpsc::Sender<()>,
) -> JoinHandle<()> {
    let mut events = registry.watch();
    tokio::spawn(async move {
        let prefix = format!("{service}/");
        info!(service, "watching for membership changes");
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !event.key().starts_with(&prefix) {
                        continue;
                    }
                    match &event {
                        RegistryEvent::Put { key, value } => {
                            warn!(%key, %value, "service endpoint added or updated")
                        }
                        RegistryEvent::Delete { key } => {
                            warn!(%key, "service endpoint removed")
                        }
                    }
                    // coalesce a storm of events into one rebuild
                    tokio::time::sleep(REBUILD_DEBOUNCE).await;
                    loop {
                        match events.try_recv() {
                            Ok(more) => {
                                debug!(key = more.key(), "coalesced membership event")
                            }
                            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    if updates.send(()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "membership watch lagged, forcing rebuild");
                    if updates.send(()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_list_deregister_roundtrip() {
        let registry = MemoryRegistry::new();
        registry.register("cache", "127.0.0.1:9001").await.unwrap();
        registry.register("cache", "127.0.0.1:9002").await.unwrap();
        registry.register("other", "127.0.0.1:7000").await.unwrap();

        let mut peers = registry.list("cache").await.unwrap();
        peers.sort();
        assert_eq!(peers, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);

        registry.deregister("cache", "127.0.0.1:9001").await.unwrap();
        assert_eq!(registry.list("cache").await.unwrap(), vec!["127.0.0.1:9002"]);
    }

    #[tokio::test]
    async fn list_does_not_leak_prefix_siblings() {
        let registry = MemoryRegistry::new();
        registry.register("cache", "a:1").await.unwrap();
        registry.register("cachex", "b:1").await.unwrap();
        assert_eq!(registry.list("cache").await.unwrap(), vec!["a:1"]);
    }

    #[tokio::test]
    async fn watch_emits_put_and_delete() {
        let registry = MemoryRegistry::new();
        let mut events = registry.watch();
        registry.register("cache", "a:1").await.unwrap();
        registry.deregister("cache", "a:1").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Put {
                key: "cache/a:1".into(),
                value: "a:1".into()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Delete {
                key: "cache/a:1".into()
            }
        );
    }

    #[tokio::test]
    async fn watch_service_debounces_bursts_into_one_token() {
        let registry = MemoryRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = watch_service(registry.clone(), "cache".to_string(), tx);

        // give the watcher a beat to subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..5 {
            registry
                .register("cache", &format!("127.0.0.1:900{i}"))
                .await
                .unwrap();
        }

        // one token for the burst
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("rebuild token")
            .expect("channel open");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err(), "burst should coalesce");
        handle.abort();
    }

    #[tokio::test]
    async fn watch_service_ignores_other_services() {
        let registry = MemoryRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = watch_service(registry.clone(), "cache".to_string(), tx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register("unrelated", "a:1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        handle.abort();
    }
}
