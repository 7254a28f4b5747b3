//! Cache replacement policies behind one uniform contract.
//!
//! Every policy manages `(String, ByteView)` entries under a byte budget and
//! exposes the same capability set: `get` (which updates policy bookkeeping),
//! `put` (which may evict to restore the budget), `remove`, `len`, `bytes`.
//! The cost charged for an entry is `key.len() + value.len()`; there is no
//! per-entry overhead charge.
//!
//! Policies are **not** internally synchronized. [`crate::cache::LocalCache`]
//! owns the lock and guarantees exclusive access for every call, including
//! `get` (which mutates recency/frequency state).
//!
//! | Policy | Eviction basis                                  |
//! |--------|-------------------------------------------------|
//! | `lru`  | least recently accessed                         |
//! | `lfu`  | lowest access count, ties by oldest insertion   |
//! | `fifo` | insertion order, accesses do not reorder        |
//! | `arc`  | adaptive recency/frequency split with ghosts    |
//! | `2q`   | probationary FIFO + main LRU                    |
//! | `slru` | probationary + protected LRU segments           |

mod arc;
mod fifo;
mod lfu;
mod list;
mod lru;
mod slru;
mod two_q;

pub use arc::ArcPolicy;
pub use fifo::FifoPolicy;
pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use slru::SlruPolicy;
pub use two_q::TwoQPolicy;

use std::str::FromStr;

use crate::byteview::ByteView;
use crate::error::CacheError;

/// Callback fired once per evicted or explicitly removed entry.
pub type EvictionCallback = Box<dyn FnMut(&str, &ByteView) + Send + Sync>;

/// Uniform capability set implemented by every replacement policy.
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    /// Looks up `key`, updating the policy's bookkeeping on a hit.
    fn get(&mut self, key: &str) -> Option<ByteView>;

    /// Inserts or updates `key`, evicting entries until the budget fits.
    fn put(&mut self, key: &str, value: ByteView);

    /// Removes `key` explicitly; fires the eviction callback on success.
    fn remove(&mut self, key: &str) -> bool;

    /// Number of resident entries.
    fn len(&self) -> usize;

    /// Bytes currently charged against the budget.
    fn bytes(&self) -> u64;
}

/// Cost charged for one entry.
pub(crate) fn entry_cost(key: &str, value: &ByteView) -> u64 {
    (key.len() + value.len()) as u64
}

/// Named policy selector, parsed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    Lfu,
    Fifo,
    Arc,
    TwoQ,
    Slru,
}

impl PolicyKind {
    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Arc => "arc",
            PolicyKind::TwoQ => "2q",
            PolicyKind::Slru => "slru",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            "fifo" => Ok(PolicyKind::Fifo),
            "arc" => Ok(PolicyKind::Arc),
            "2q" | "two_q" | "twoq" => Ok(PolicyKind::TwoQ),
            "slru" => Ok(PolicyKind::Slru),
            other => Err(CacheError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Constructs a policy by name.
///
/// Fails with [`CacheError::UnknownStrategy`] for unrecognized names and
/// [`CacheError::InvalidCacheSize`] for a zero budget.
pub fn new_policy(
    name: &str,
    max_bytes: u64,
    on_evicted: Option<EvictionCallback>,
) -> Result<Box<dyn EvictionPolicy>, CacheError> {
    if max_bytes == 0 {
        return Err(CacheError::InvalidCacheSize(max_bytes));
    }
    let kind: PolicyKind = name.parse()?;
    Ok(match kind {
        PolicyKind::Lru => Box::new(LruPolicy::new(max_bytes, on_evicted)),
        PolicyKind::Lfu => Box::new(LfuPolicy::new(max_bytes, on_evicted)),
        PolicyKind::Fifo => Box::new(FifoPolicy::new(max_bytes, on_evicted)),
        PolicyKind::Arc => Box::new(ArcPolicy::new(max_bytes, on_evicted)),
        PolicyKind::TwoQ => Box::new(TwoQPolicy::new(max_bytes, on_evicted)),
        PolicyKind::Slru => Box::new(SlruPolicy::new(max_bytes, on_evicted)),
    })
}
