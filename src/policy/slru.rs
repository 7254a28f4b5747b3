//! Segmented LRU: probationary and protected LRU segments.
//!
//! New keys enter the probationary segment. A hit while probationary promotes
//! the entry to the protected segment; when the protected segment exceeds its
//! fixed share of the budget, its LRU entries are demoted back to probation
//! rather than dropped. Eviction always drains the probationary LRU first, so
//! scans cannot flush the protected working set.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::list::{LinkedOrder, NodeId};
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

/// Fraction of the byte budget reserved for the protected segment.
const PROTECTED_FRAC: f64 = 0.8;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Segment {
    Probationary,
    Protected,
}

struct Entry {
    key: String,
    value: ByteView,
}

pub struct SlruPolicy {
    max_bytes: u64,
    protected_cap: u64,
    probationary_bytes: u64,
    protected_bytes: u64,
    index: FxHashMap<String, (Segment, NodeId)>,
    // both segments: front = MRU, back = LRU
    probationary: LinkedOrder<Entry>,
    protected: LinkedOrder<Entry>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for SlruPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlruPolicy").finish_non_exhaustive()
    }
}

impl SlruPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            protected_cap: (max_bytes as f64 * PROTECTED_FRAC) as u64,
            probationary_bytes: 0,
            protected_bytes: 0,
            index: FxHashMap::default(),
            probationary: LinkedOrder::new(),
            protected: LinkedOrder::new(),
            on_evicted,
        }
    }

    fn fire(&mut self, key: &str, value: &ByteView) {
        if let Some(cb) = self.on_evicted.as_mut() {
            cb(key, value);
        }
    }

    /// Demotes protected LRU entries until the segment fits its share.
    fn rebalance_protected(&mut self) {
        while self.protected_bytes > self.protected_cap {
            let Some(entry) = self.protected.pop_back() else {
                break;
            };
            let cost = entry_cost(&entry.key, &entry.value);
            self.protected_bytes -= cost;
            self.probationary_bytes += cost;
            let key = entry.key.clone();
            let id = self.probationary.push_front(entry);
            self.index.insert(key, (Segment::Probationary, id));
        }
    }

    fn evict_to_budget(&mut self) {
        while self.probationary_bytes + self.protected_bytes > self.max_bytes {
            let (entry, segment) = if !self.probationary.is_empty() {
                (self.probationary.pop_back(), Segment::Probationary)
            } else {
                (self.protected.pop_back(), Segment::Protected)
            };
            let Some(entry) = entry else {
                break;
            };
            let cost = entry_cost(&entry.key, &entry.value);
            match segment {
                Segment::Probationary => self.probationary_bytes -= cost,
                Segment::Protected => self.protected_bytes -= cost,
            }
            self.index.remove(&entry.key);
            self.fire(&entry.key, &entry.value);
        }
    }
}

impl EvictionPolicy for SlruPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        let &(segment, id) = self.index.get(key)?;
        match segment {
            Segment::Probationary => {
                let entry = self.probationary.remove(id)?;
                let cost = entry_cost(&entry.key, &entry.value);
                let value = entry.value.clone();
                self.probationary_bytes -= cost;
                self.protected_bytes += cost;
                let new_id = self.protected.push_front(entry);
                self.index
                    .insert(key.to_string(), (Segment::Protected, new_id));
                self.rebalance_protected();
                Some(value)
            }
            Segment::Protected => {
                self.protected.move_to_front(id);
                self.protected.get(id).map(|e| e.value.clone())
            }
        }
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

        if let Some(&(segment, id)) = self.index.get(key) {
            let list = match segment {
                Segment::Probationary => &mut self.probationary,
                Segment::Protected => &mut self.protected,
            };
            if let Some(entry) = list.get_mut(id) {
                let old = entry_cost(&entry.key, &entry.value);
                entry.value = value;
                match segment {
                    Segment::Probationary => {
                        self.probationary_bytes = self.probationary_bytes - old + cost
                    }
                    Segment::Protected => self.protected_bytes = self.protected_bytes - old + cost,
                }
            }
            self.rebalance_protected();
        } else {
            let id = self.probationary.push_front(Entry {
                key: key.to_string(),
                value,
            });
            self.index
                .insert(key.to_string(), (Segment::Probationary, id));
            self.probationary_bytes += cost;
        }
        self.evict_to_budget();
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some((segment, id)) = self.index.remove(key) else {
            return false;
        };
        let entry = match segment {
            Segment::Probationary => self.probationary.remove(id),
            Segment::Protected => self.protected.remove(id),
        };
        if let Some(entry) = entry {
            let cost = entry_cost(&entry.key, &entry.value);
            match segment {
                Segment::Probationary => self.probationary_bytes -= cost,
                Segment::Protected => self.protected_bytes -= cost,
            }
            self.fire(&entry.key, &entry.value);
        }
        true
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn bytes(&self) -> u64 {
        self.probationary_bytes + self.protected_bytes
    }
}
