//! RPC client: resolves a peer and fetches one `(group, key)`.
//!
//! The `service` string carries the routing decision: a bare name like
//! `"groupcache"` is resolved through the registry with round-robin over the
//! listed peers, while `"groupcache/127.0.0.1:9001"` dials that address
//! directly — the form used when a picker has already chosen the owner.
//!
//! Every call gets a deadline (1s by default). Transport-level failures are
//! retried with exponential backoff (`2^retry` seconds, at most 3 retries);
//! remote application errors (`NotFound`, `Internal`) are surfaced as-is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::discovery::ServiceRegistry;
use crate::error::CacheError;
use crate::peers::Fetcher;
use crate::rpc::{read_frame, write_frame, GetRequest, GetResponse, Status};

/// Default per-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

pub struct Client {
    service: String,
    registry: Arc<dyn ServiceRegistry>,
    timeout: Duration,
    round_robin: AtomicUsize,
}

impl Client {
    pub fn new(service: impl Into<String>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_timeout(service, registry, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(
        service: impl Into<String>,
        registry: Arc<dyn ServiceRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            registry,
            timeout,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Picks the target address for the next call.
    async fn resolve(&self) -> Result<String, CacheError> {
        // "<service>/<addr>" means the caller already chose the target
        if let Some((_, addr)) = self.service.split_once('/') {
            debug!(addr, "dialing direct target address");
            return Ok(addr.to_string());
        }
        let peers = self.registry.list(&self.service).await?;
        if peers.is_empty() {
            return Err(CacheError::Registry(format!(
                "no peers registered for service {:?}",
                self.service
            )));
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % peers.len();
        Ok(peers[idx].clone())
    }

    async fn call_once(&self, addr: &str, request: &GetRequest) -> Result<Vec<u8>, CacheError> {
        let call = async {
            let mut stream =
                TcpStream::connect(addr)
                    .await
                    .map_err(|err| CacheError::PeerUnavailable {
                        addr: addr.to_string(),
                        message: err.to_string(),
                    })?;
            write_frame(&mut stream, request).await?;
            let response: GetResponse = read_frame(&mut stream)
                .await?
                .ok_or_else(|| CacheError::PeerUnavailable {
                    addr: addr.to_string(),
                    message: "connection closed before response".to_string(),
                })?;
            match response.status {
                Status::Ok => Ok(response.value),
                Status::NotFound => Err(CacheError::NotFound(request.key.clone())),
                Status::Unavailable => Err(CacheError::PeerUnavailable {
                    addr: addr.to_string(),
                    message: response.message,
                }),
                Status::Internal => Err(CacheError::Rpc(response.message)),
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::PeerUnavailable {
                addr: addr.to_string(),
                message: format!("call timed out after {:?}", self.timeout),
            }),
        }
    }
}

#[async_trait]
impl Fetcher for Client {
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError> {
        let request = GetRequest {
            group: group.to_string(),
            key: key.to_string(),
            redirected: true,
        };
        let mut retry = 0u32;
        loop {
            let addr = self.resolve().await?;
            match self.call_once(&addr, &request).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unavailable() && retry < MAX_RETRIES => {
                    let backoff = Duration::from_secs(1 << retry);
                    warn!(%err, retry, ?backoff, "peer call failed, backing off");
                    tokio::time::sleep(backoff).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
