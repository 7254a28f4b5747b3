//! distcache: distributed in-memory cache core.
//!
//! Each node owns a partition of the keyspace via a consistent-hash ring kept
//! live by a discovery registry; any node serves any key by forwarding to the
//! owner over a small RPC protocol. Local storage is a byte-budgeted cache
//! with interchangeable eviction policies, and concurrent loads of one key
//! collapse into a single backing-store call.

pub mod byteview;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod group;
pub mod metrics;
pub mod peers;
pub mod policy;
pub mod ring;
pub mod rpc;
pub mod singleflight;

pub use byteview::ByteView;
pub use error::CacheError;
pub use group::{destroy_group, get_group, new_group, new_group_with_ttl, Group, Retriever, RetrieverFn};
