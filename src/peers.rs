//! Seams between a group and the peer transport.
//!
//! `Fetcher` retrieves one `(group, key)` from a specific remote peer;
//! `PeerPicker` maps a key to the fetcher for its owning peer. The production
//! picker is the ring-backed RPC server; tests substitute fixed pickers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheError;

/// Retrieves a value from one remote peer.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Locates the owner of a key.
#[async_trait]
pub trait PeerPicker: Send + Sync {
    /// Returns the fetcher for the remote owner of `key`.
    ///
    /// `None` means the caller should load locally: either this node owns the
    /// key or no peers are known (empty ring).
    fn pick(&self, key: &str) -> Option<Arc<dyn Fetcher>>;

    /// Releases transport resources. Invoked when the owning group is
    /// destroyed.
    async fn shutdown(&self) {}
}
