//! First-in-first-out replacement.
//!
//! Entries keep their insertion position for their whole lifetime: `get`
//! never reorders and updating a key in place does not refresh its age.
//! Eviction pops from the head of the insertion queue.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::list::{LinkedOrder, NodeId};
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

struct Entry {
    key: String,
    value: ByteView,
}

pub struct FifoPolicy {
    max_bytes: u64,
    used: u64,
    index: FxHashMap<String, NodeId>,
    // front = oldest insertion
    queue: LinkedOrder<Entry>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for FifoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoPolicy").finish_non_exhaustive()
    }
}

impl FifoPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            used: 0,
            index: FxHashMap::default(),
            queue: LinkedOrder::new(),
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
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.used -= entry_cost(&entry.key, &entry.value);
            self.index.remove(&entry.key);
            self.fire(&entry.key, &entry.value);
        }
    }
}

impl EvictionPolicy for FifoPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        let id = *self.index.get(key)?;
        self.queue.get(id).map(|e| e.value.clone())
    }

    fn put(&mut self, key: &str, value: ByteView) {
        let cost = entry_cost(key, &value);
        if cost > self.max_bytes {
            if self.remove(key) {
                warn!(key, cost, budget = self.max_bytes, "evicted stale entry for oversized update");
            } else {
                warn!(key, cost, budget = self.max_bytes, "refusing oversized entry");
            }
            return;
        }

        if let Some(&id) = self.index.get(key) {
            // in-place update, position unchanged
            if let Some(entry) = self.queue.get_mut(id) {
                self.used = self.used - entry_cost(&entry.key, &entry.value) + cost;
                entry.value = value;
            }
        } else {
            let id = self.queue.push_back(Entry {
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
        if let Some(entry) = self.queue.remove(id) {
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
