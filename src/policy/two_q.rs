//! 2Q replacement: probationary FIFO in front of a main LRU.
//!
//! New keys are admitted into a probationary FIFO queue capped at a fraction
//! of the byte budget. A second access while probationary promotes the entry
//! to the main LRU; one-shot keys age out of probation without ever touching
//! the main queue. Eviction drains probation first whenever it is over its
//! share, otherwise the main LRU tail.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::list::{LinkedOrder, NodeId};
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

/// Fraction of the byte budget reserved for the probationary queue.
const PROBATION_FRAC: f64 = 0.25;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Queue {
    Probation,
    Main,
}

struct Entry {
    key: String,
    value: ByteView,
}

pub struct TwoQPolicy {
    max_bytes: u64,
    probation_cap: u64,
    probation_bytes: u64,
    main_bytes: u64,
    index: FxHashMap<String, (Queue, NodeId)>,
    // front = newest arrival; eviction pops the back
    probation: LinkedOrder<Entry>,
    // front = MRU
    main: LinkedOrder<Entry>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for TwoQPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoQPolicy").finish_non_exhaustive()
    }
}

impl TwoQPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            probation_cap: (max_bytes as f64 * PROBATION_FRAC) as u64,
            probation_bytes: 0,
            main_bytes: 0,
            index: FxHashMap::default(),
            probation: LinkedOrder::new(),
            main: LinkedOrder::new(),
            on_evicted,
        }
    }

    fn fire(&mut self, key: &str, value: &ByteView) {
        if let Some(cb) = self.on_evicted.as_mut() {
            cb(key, value);
        }
    }

    fn used(&self) -> u64 {
        self.probation_bytes + self.main_bytes
    }

    fn evict_one(&mut self) -> bool {
        let from_probation = if self.probation.is_empty() {
            false
        } else if self.main.is_empty() {
            true
        } else {
            self.probation_bytes > self.probation_cap
        };

        let entry = if from_probation {
            self.probation.pop_back()
        } else {
            self.main.pop_back()
        };
        let Some(entry) = entry else {
            return false;
        };
        let cost = entry_cost(&entry.key, &entry.value);
        if from_probation {
            self.probation_bytes -= cost;
        } else {
            self.main_bytes -= cost;
        }
        self.index.remove(&entry.key);
        self.fire(&entry.key, &entry.value);
        true
    }

    fn evict_to_budget(&mut self) {
        while self.used() > self.max_bytes {
            if !self.evict_one() {
                break;
            }
        }
    }
}

impl EvictionPolicy for TwoQPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        let &(queue, id) = self.index.get(key)?;
        match queue {
            Queue::Probation => {
                // second access: promote to the main LRU
                let entry = self.probation.remove(id)?;
                let cost = entry_cost(&entry.key, &entry.value);
                let value = entry.value.clone();
                self.probation_bytes -= cost;
                self.main_bytes += cost;
                let new_id = self.main.push_front(entry);
                self.index.insert(key.to_string(), (Queue::Main, new_id));
                Some(value)
            }
            Queue::Main => {
                self.main.move_to_front(id);
                self.main.get(id).map(|e| e.value.clone())
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

        if let Some(&(queue, id)) = self.index.get(key) {
            let list = match queue {
                Queue::Probation => &mut self.probation,
                Queue::Main => &mut self.main,
            };
            if let Some(entry) = list.get_mut(id) {
                let old = entry_cost(&entry.key, &entry.value);
                entry.value = value;
                match queue {
                    Queue::Probation => self.probation_bytes = self.probation_bytes - old + cost,
                    Queue::Main => self.main_bytes = self.main_bytes - old + cost,
                }
            }
        } else {
            let id = self.probation.push_front(Entry {
                key: key.to_string(),
                value,
            });
            self.index.insert(key.to_string(), (Queue::Probation, id));
            self.probation_bytes += cost;
        }
        self.evict_to_budget();
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some((queue, id)) = self.index.remove(key) else {
            return false;
        };
        let entry = match queue {
            Queue::Probation => self.probation.remove(id),
            Queue::Main => self.main.remove(id),
        };
        if let Some(entry) = entry {
            let cost = entry_cost(&entry.key, &entry.value);
            match queue {
                Queue::Probation => self.probation_bytes -= cost,
                Queue::Main => self.main_bytes -= cost,
            }
            self.fire(&entry.key, &entry.value);
        }
        true
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn bytes(&self) -> u64 {
        self.used()
    }
}
