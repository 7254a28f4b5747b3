//! Error types for the distcache crate.
//!
//! A single crate-wide enum keeps error classification aligned with how the
//! cache reacts to each failure: invalid input is surfaced and never retried,
//! `NotFound` is negative-cached, retriever failures are surfaced uncached,
//! and peer failures degrade to local retrieval.
//!
//! The enum is `Clone` because the single-flight layer memoizes completed
//! results — errors included — and replays them to concurrent and near-future
//! callers.

use thiserror::Error;

/// Errors produced by cache groups and their collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The caller asked for an empty key.
    #[error("key cannot be empty")]
    EmptyKey,

    /// The configured cache budget is unusable.
    #[error("cache size must be positive, got {0}")]
    InvalidCacheSize(u64),

    /// The configured eviction strategy name is not recognized.
    #[error("unknown eviction strategy {0:?}")]
    UnknownStrategy(String),

    /// The key is absent from the authoritative backing store.
    #[error("key {0:?} not found")]
    NotFound(String),

    /// The backing store failed for a reason other than absence.
    #[error("retriever failed for key {key:?}: {message}")]
    Retriever { key: String, message: String },

    /// A peer could not be reached or answered with a transport-level failure.
    #[error("peer {addr:?} unavailable: {message}")]
    PeerUnavailable { addr: String, message: String },

    /// Malformed or oversized wire traffic, or a remote internal failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The discovery registry rejected or failed an operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// The shared loader for a key panicked; all waiters observe this.
    #[error("loader panicked for key {0:?}")]
    LoaderPanic(String),

    /// `register_server` was called on a group that already has a picker.
    #[error("server already registered for group {0:?}")]
    ServerAlreadyRegistered(String),

    /// A configuration value failed validation at startup.
    #[error("invalid config: {0}")]
    Config(String),
}

impl CacheError {
    /// Returns `true` for the absence error that gets negative-cached.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    /// Returns `true` for transport failures that the client may retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::PeerUnavailable { .. })
    }
}
