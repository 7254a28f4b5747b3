//! Least-frequently-used replacement.
//!
//! Each entry carries an access counter (1 at insertion, +1 per `get`) and a
//! monotonic insertion sequence number. The eviction order is the ordered set
//! of `(frequency, sequence, key)` triples, so the victim is always the entry
//! with the smallest counter and, among equals, the oldest insertion.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

struct Entry {
    value: ByteView,
    freq: u64,
    seq: u64,
}

pub struct LfuPolicy {
    max_bytes: u64,
    used: u64,
    next_seq: u64,
    index: FxHashMap<String, Entry>,
    order: BTreeSet<(u64, u64, String)>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for LfuPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LfuPolicy").finish_non_exhaustive()
    }
}

impl LfuPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            used: 0,
            next_seq: 0,
            index: FxHashMap::default(),
            order: BTreeSet::new(),
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
            let Some((freq, seq, key)) = self.order.first().cloned() else {
                break;
            };
            self.order.remove(&(freq, seq, key.clone()));
            if let Some(entry) = self.index.remove(&key) {
                self.used -= entry_cost(&key, &entry.value);
                self.fire(&key, &entry.value);
            }
        }
    }
}

impl EvictionPolicy for LfuPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        let entry = self.index.get_mut(key)?;
        let old = (entry.freq, entry.seq, key.to_string());
        entry.freq += 1;
        let new = (entry.freq, entry.seq, key.to_string());
        let value = entry.value.clone();
        self.order.remove(&old);
        self.order.insert(new);
        Some(value)
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

        if let Some(entry) = self.index.get_mut(key) {
            // update keeps frequency and insertion age
            self.used = self.used - entry_cost(key, &entry.value) + cost;
            entry.value = value;
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.index.insert(
                key.to_string(),
                Entry {
                    value,
                    freq: 1,
                    seq,
                },
            );
            self.order.insert((1, seq, key.to_string()));
            self.used += cost;
        }
        self.evict_to_budget();
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.index.remove(key) else {
            return false;
        };
        self.order.remove(&(entry.freq, entry.seq, key.to_string()));
        self.used -= entry_cost(key, &entry.value);
        self.fire(key, &entry.value);
        true
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn bytes(&self) -> u64 {
        self.used
    }
}
