//! Least-recently-used replacement.
//!
//! A recency list (front = most recent) plus a key index. `get` moves the
//! entry to the front; `put` refreshes recency and evicts from the back until
//! the byte budget fits.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::list::{LinkedOrder, NodeId};
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

struct Entry {
    key: String,
    value: ByteView,
}

pub struct LruPolicy {
    max_bytes: u64,
    used: u64,
    index: FxHashMap<String, NodeId>,
    order: LinkedOrder<Entry>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for LruPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruPolicy").finish_non_exhaustive()
    }
}

impl LruPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            used: 0,
            index: FxHashMap::default(),
            order: LinkedOrder::new(),
            on_evicted,
        }
    }

    fn fire(&mut self, key: &str, value: &ByteView) {
        if let Some(cb) = self.on_evicted.as_mut() {
            cb(key, value);
        }
    }

    fn evict_to_budget(&mut self) {
        while self.used > self.max_bytes {
            let Some(entry) = self.order.pop_back() else {
                break;
            };
            self.used -= entry_cost(&entry.key, &entry.value);
            self.index.remove(&entry.key);
            self.fire(&entry.key, &entry.value);
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        let id = *self.index.get(key)?;
        self.order.move_to_front(id);
        self.order.get(id).map(|e| e.value.clone())
    }

    fn put(&mut self, key: &str, value: ByteView) {
        let cost = entry_cost(key, &value);
        if cost > self.max_bytes {
            // Admitting this entry could never satisfy the budget invariant.
            if self.remove(key) {
                warn!(key, cost, budget = self.max_bytes, "evicted stale entry for oversized update");
            } else {
                warn!(key, cost, budget = self.max_bytes, "refusing oversized entry");
            }
            return;
        }

        if let Some(&id) = self.index.get(key) {
            self.order.move_to_front(id);
            if let Some(entry) = self.order.get_mut(id) {
                self.used = self.used - entry_cost(&entry.key, &entry.value) + cost;
                entry.value = value;
            }
        } else {
            let id = self.order.push_front(Entry {
                key: key.to_string(),
                value,
            });
            self.index.insert(key.to_string(), id);
            self.used += cost;
        }
        self.evict_to_budget();
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(id) = self.index.remove(key) else {
            return false;
        };
        if let Some(entry) = self.order.remove(id) {
            self.used -= entry_cost(&entry.key, &entry.value);
            self.fire(&entry.key, &entry.value);
        }
        true
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn bytes(&self) -> u64 {
        self.used
    }
}
