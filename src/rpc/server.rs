//! RPC server: serves `Get(group, key)` to peers and doubles as the
//! ring-backed peer picker for the groups registered on this node.
//!
//! `Server` is a cheap clone over shared inner state, so the accept loop and
//! the watch-driven rebuild loop hold the same ring and client pool the
//! picker reads.
//!
//! Lifecycle, mirroring the node bootstrap order: `start` binds the listener
//! (ephemeral ports supported), registers the node in discovery, seeds the
//! ring from the peers already present, and spawns the watch loop that
//! rebuilds the ring on every membership change. `stop` deregisters and
//! shuts the loops down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{watch_service, ServiceRegistry};
use crate::error::CacheError;
use crate::group::get_group;
use crate::peers::{Fetcher, PeerPicker};
use crate::ring::{HashRing, DEFAULT_REPLICAS};
use crate::rpc::client::{Client, DEFAULT_RPC_TIMEOUT};
use crate::rpc::{read_frame, write_frame, GetRequest, GetResponse, Status};

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    service: String,
    registry: Arc<dyn ServiceRegistry>,
    ring: HashRing,
    clients: RwLock<FxHashMap<String, Arc<Client>>>,
    self_addr: RwLock<Option<String>>,
    rpc_timeout: Duration,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(service: impl Into<String>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_options(service, registry, DEFAULT_REPLICAS, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_options(
        service: impl Into<String>,
        registry: Arc<dyn ServiceRegistry>,
        replicas: usize,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                service: service.into(),
                registry,
                ring: HashRing::new(replicas),
                clients: RwLock::new(FxHashMap::default()),
                self_addr: RwLock::new(None),
                rpc_timeout,
                shutdown: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Binds, registers with discovery, seeds the ring, and starts serving.
    ///
    /// Returns the bound address (useful with a `:0` bind).
    pub async fn start(&self, bind: &str) -> Result<SocketAddr, CacheError> {
        let inner = &self.inner;
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|err| CacheError::Rpc(format!("bind {bind}: {err}")))?;
        let local = listener
            .local_addr()
            .map_err(|err| CacheError::Rpc(format!("local addr: {err}")))?;
        let addr = local.to_string();
        *inner.self_addr.write() = Some(addr.clone());

        inner.registry.register(&inner.service, &addr).await?;
        // seed the ring with peers that joined before us (self included)
        let peers = inner.registry.list(&inner.service).await?;
        self.set_peers(&peers);

        let (token_tx, mut token_rx) = mpsc::channel(8);
        let watcher = watch_service(inner.registry.clone(), inner.service.clone(), token_tx);
        let this = self.clone();
        let rebuilder = tokio::spawn(async move {
            while token_rx.recv().await.is_some() {
                match this.inner.registry.list(&this.inner.service).await {
                    Ok(peers) => this.set_peers(&peers),
                    Err(err) => warn!(%err, "failed to list peers for ring rebuild"),
                }
            }
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        *inner.shutdown.lock() = Some(stop_tx);
        let this = self.clone();
        let acceptor = tokio::spawn(async move {
            this.accept_loop(listener, stop_rx).await;
        });
        inner.tasks.lock().extend([watcher, rebuilder, acceptor]);

        info!(service = %inner.service, %local, "cache server started");
        Ok(local)
    }

    /// Deregisters and stops the accept and watch loops.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let addr = inner.self_addr.read().clone();
        if let Some(addr) = addr {
            if let Err(err) = inner.registry.deregister(&inner.service, &addr).await {
                error!(%err, "failed to deregister");
            }
        }
        if let Some(stop) = inner.shutdown.lock().take() {
            let _ = stop.send(());
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(service = %inner.service, "cache server stopped");
    }

    /// Atomically replaces the ring membership.
    pub fn set_peers(&self, peers: &[String]) {
        self.inner.ring.set(peers);
        // drop pooled clients for peers that left
        self.inner
            .clients
            .write()
            .retain(|addr, _| peers.iter().any(|peer| peer == addr));
        info!(service = %self.inner.service, count = peers.len(), "hash ring rebuilt");
    }

    /// The address this server registered under, once started.
    pub fn self_addr(&self) -> Option<String> {
        self.inner.self_addr.read().clone()
    }

    /// Owner address for `key` in the current ring view, for tests and
    /// operational introspection.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.inner.ring.pick(key).map(|peer| peer.to_string())
    }

    /// Distinct peer addresses in the current ring view.
    pub fn peers(&self) -> Vec<String> {
        self.inner
            .ring
            .peers()
            .iter()
            .map(|peer| peer.to_string())
            .collect()
    }

    async fn accept_loop(self, listener: TcpListener, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "peer connection accepted");
                        tokio::spawn(handle_connection(stream));
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                },
            }
        }
    }
}

/// Serves frames on one connection until the peer hangs up.
async fn handle_connection(mut stream: TcpStream) {
    loop {
        let request: GetRequest = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "malformed request frame");
                break;
            }
        };
        let response = dispatch(request).await;
        if let Err(err) = write_frame(&mut stream, &response).await {
            warn!(%err, "failed to write response");
            break;
        }
    }
}

async fn dispatch(request: GetRequest) -> GetResponse {
    let Some(group) = get_group(&request.group) else {
        return GetResponse::error(
            Status::NotFound,
            format!("unknown group {:?}", request.group),
        );
    };
    // redirected requests must be answered locally to prevent forward loops
    let result = if request.redirected {
        group.get_redirected(&request.key).await
    } else {
        group.get(&request.key).await
    };
    match result {
        Ok(view) => GetResponse::ok(view.to_vec()),
        Err(err) if err.is_not_found() => GetResponse::error(Status::NotFound, err.to_string()),
        Err(err) => GetResponse::error(Status::Internal, err.to_string()),
    }
}

#[async_trait::async_trait]
impl PeerPicker for Server {
    fn pick(&self, key: &str) -> Option<Arc<dyn Fetcher>> {
        let inner = &self.inner;
        let owner = inner.ring.pick(key)?;
        let self_addr = inner.self_addr.read().clone()?;
        if owner.as_ref() == self_addr {
            return None;
        }
        let mut clients = inner.clients.write();
        let client = clients
            .entry(owner.to_string())
            .or_insert_with(|| {
                Arc::new(Client::with_timeout(
                    // direct-dial form: the ring already chose the target
                    format!("{}/{}", inner.service, owner),
                    inner.registry.clone(),
                    inner.rpc_timeout,
                ))
            })
            .clone();
        Some(client as Arc<dyn Fetcher>)
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
