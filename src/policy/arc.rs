//! Adaptive Replacement Cache, byte-weighted.
//!
//! Four lists share the budget `c` (in bytes): `t1` holds entries seen once,
//! `t2` entries seen at least twice, and `b1`/`b2` are ghost lists recording
//! the keys (and costs) recently evicted from each side. The adaptive target
//! `p` ∈ [0, c] is the number of bytes granted to the recency side: a ghost
//! hit in `b1` grows `p` (recency was under-provisioned), a ghost hit in `b2`
//! shrinks it. REPLACE evicts from `t1` while it holds more than `p` bytes,
//! otherwise from `t2`.
//!
//! Invariants kept by every mutation:
//! - `t1_bytes + t2_bytes ≤ c`
//! - `t1_bytes + b1_bytes ≤ c`
//! - `t1_bytes + t2_bytes + b1_bytes + b2_bytes ≤ 2c`

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::byteview::ByteView;
use crate::policy::list::{LinkedOrder, NodeId};
use crate::policy::{entry_cost, EvictionCallback, EvictionPolicy};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Location {
    T1(NodeId),
    T2(NodeId),
    B1(NodeId),
    B2(NodeId),
}

struct Resident {
    key: String,
    value: ByteView,
}

struct Ghost {
    key: String,
    cost: u64,
}

pub struct ArcPolicy {
    c: u64,
    p: u64,
    t1_bytes: u64,
    t2_bytes: u64,
    b1_bytes: u64,
    b2_bytes: u64,
    index: FxHashMap<String, Location>,
    // all four lists: front = most recent
    t1: LinkedOrder<Resident>,
    t2: LinkedOrder<Resident>,
    b1: LinkedOrder<Ghost>,
    b2: LinkedOrder<Ghost>,
    on_evicted: Option<EvictionCallback>,
}


impl std::fmt::Debug for ArcPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcPolicy").finish_non_exhaustive()
    }
}

impl ArcPolicy {
    pub fn new(max_bytes: u64, on_evicted: Option<EvictionCallback>) -> Self {
        Self {
            c: max_bytes,
            p: 0,
            t1_bytes: 0,
            t2_bytes: 0,
            b1_bytes: 0,
            b2_bytes: 0,
            index: FxHashMap::default(),
            t1: LinkedOrder::new(),
            t2: LinkedOrder::new(),
            b1: LinkedOrder::new(),
            b2: LinkedOrder::new(),
            on_evicted,
        }
    }

    /// Adaptive target in bytes, for inspection in tests.
    #[cfg(test)]
    fn p_value(&self) -> u64 {
        self.p
    }

    fn fire(&mut self, key: &str, value: &ByteView) {
        if let Some(cb) = self.on_evicted.as_mut() {
            cb(key, value);
        }
    }

    /// One REPLACE step: demote a resident LRU entry into its ghost list.
    fn replace(&mut self, b2_hit: bool) -> bool {
        let from_t1 = if self.t1.is_empty() {
            false
        } else if self.t2.is_empty() {
            true
        } else {
            self.t1_bytes > self.p || (b2_hit && self.t1_bytes == self.p)
        };

        if from_t1 {
            let Some(entry) = self.t1.pop_back() else {
                return false;
            };
            let cost = entry_cost(&entry.key, &entry.value);
            self.t1_bytes -= cost;
            self.b1_bytes += cost;
            let ghost_id = self.b1.push_front(Ghost {
                key: entry.key.clone(),
                cost,
            });
            self.index.insert(entry.key.clone(), Location::B1(ghost_id));
            self.fire(&entry.key, &entry.value);
            true
        } else {
            let Some(entry) = self.t2.pop_back() else {
                return false;
            };
            let cost = entry_cost(&entry.key, &entry.value);
            self.t2_bytes -= cost;
            self.b2_bytes += cost;
            let ghost_id = self.b2.push_front(Ghost {
                key: entry.key.clone(),
                cost,
            });
            self.index.insert(entry.key.clone(), Location::B2(ghost_id));
            self.fire(&entry.key, &entry.value);
            true
        }
    }

    /// Evicts residents until `incoming` more bytes fit under `c`.
    fn make_room(&mut self, incoming: u64, b2_hit: bool) {
        while self.t1_bytes + self.t2_bytes + incoming > self.c {
            if !self.replace(b2_hit) {
                break;
            }
        }
    }

    fn drop_b1_lru(&mut self) -> bool {
        match self.b1.pop_back() {
            Some(ghost) => {
                self.b1_bytes -= ghost.cost;
                self.index.remove(&ghost.key);
                true
            }
            None => false,
        }
    }

    fn drop_b2_lru(&mut self) -> bool {
        match self.b2.pop_back() {
            Some(ghost) => {
                self.b2_bytes -= ghost.cost;
                self.index.remove(&ghost.key);
                true
            }
            None => false,
        }
    }

    fn total_bytes(&self) -> u64 {
        self.t1_bytes + self.t2_bytes + self.b1_bytes + self.b2_bytes
    }

    /// Re-establishes the ghost bounds after any mutation that grew a list.
    fn trim_ghosts(&mut self) {
        while self.t1_bytes + self.b1_bytes > self.c {
            if !self.drop_b1_lru() {
                break;
            }
        }
        while self.total_bytes() > 2 * self.c {
            if !self.drop_b2_lru() && !self.drop_b1_lru() {
                break;
            }
        }
    }

    /// Drops an entry entirely (no ghost), used when L1 is saturated.
    fn discard_t1_lru(&mut self) -> bool {
        match self.t1.pop_back() {
            Some(entry) => {
                let cost = entry_cost(&entry.key, &entry.value);
                self.t1_bytes -= cost;
                self.index.remove(&entry.key);
                self.fire(&entry.key, &entry.value);
                true
            }
            None => false,
        }
    }

    /// Moves a `t1` resident to the front of `t2`.
    fn promote_to_t2(&mut self, id: NodeId) -> Option<ByteView> {
        let entry = self.t1.remove(id)?;
        let cost = entry_cost(&entry.key, &entry.value);
        let value = entry.value.clone();
        self.t1_bytes -= cost;
        self.t2_bytes += cost;
        let key = entry.key.clone();
        let new_id = self.t2.push_front(entry);
        self.index.insert(key, Location::T2(new_id));
        Some(value)
    }
}

impl EvictionPolicy for ArcPolicy {
    fn get(&mut self, key: &str) -> Option<ByteView> {
        match *self.index.get(key)? {
            Location::T1(id) => self.promote_to_t2(id),
            Location::T2(id) => {
                self.t2.move_to_front(id);
                self.t2.get(id).map(|e| e.value.clone())
            }
            // ghosts only influence adaptation on re-admission via put
            Location::B1(_) | Location::B2(_) => None,
        }
    }

    fn put(&mut self, key: &str, value: ByteView) {
        let cost = entry_cost(key, &value);
        if cost > self.c {
            if self.remove(key) {
                warn!(key, cost, budget = self.c, "evicted stale entry for oversized update");
            } else {
                warn!(key, cost, budget = self.c, "refusing oversized entry");
            }
            return;
        }

        match self.index.get(key).copied() {
            Some(Location::T1(id)) => {
                if let Some(entry) = self.t1.get_mut(id) {
                    let old = entry_cost(&entry.key, &entry.value);
                    entry.value = value;
                    self.t1_bytes = self.t1_bytes - old + cost;
                }
                let _ = self.promote_to_t2(id);
                self.make_room(0, false);
            }
            Some(Location::T2(id)) => {
                if let Some(entry) = self.t2.get_mut(id) {
                    let old = entry_cost(&entry.key, &entry.value);
                    entry.value = value;
                    self.t2_bytes = self.t2_bytes - old + cost;
                }
                self.t2.move_to_front(id);
                self.make_room(0, false);
            }
            Some(Location::B1(id)) => {
                // recency ghost hit: grow the recency target
                let delta = cost.max(self.b2_bytes / self.b1_bytes.max(1));
                self.p = (self.p + delta).min(self.c);
                if let Some(ghost) = self.b1.remove(id) {
                    self.b1_bytes -= ghost.cost;
                }
                self.index.remove(key);
                self.make_room(cost, false);
                let id = self.t2.push_front(Resident {
                    key: key.to_string(),
                    value,
                });
                self.index.insert(key.to_string(), Location::T2(id));
                self.t2_bytes += cost;
            }
            Some(Location::B2(id)) => {
                // frequency ghost hit: shrink the recency target
                let delta = cost.max(self.b1_bytes / self.b2_bytes.max(1));
                self.p = self.p.saturating_sub(delta);
                if let Some(ghost) = self.b2.remove(id) {
                    self.b2_bytes -= ghost.cost;
                }
                self.index.remove(key);
                self.make_room(cost, true);
                let id = self.t2.push_front(Resident {
                    key: key.to_string(),
                    value,
                });
                self.index.insert(key.to_string(), Location::T2(id));
                self.t2_bytes += cost;
            }
            None => {
                // keep |T1| + |B1| within c
                while self.t1_bytes + self.b1_bytes + cost > self.c {
                    if self.drop_b1_lru() {
                        continue;
                    }
                    if self.discard_t1_lru() {
                        continue;
                    }
                    break;
                }
                // keep the four lists within 2c
                while self.t1_bytes + self.t2_bytes + self.b1_bytes + self.b2_bytes + cost
                    > 2 * self.c
                {
                    if self.drop_b2_lru() {
                        continue;
                    }
                    if self.drop_b1_lru() {
                        continue;
                    }
                    break;
                }
                self.make_room(cost, false);
                let id = self.t1.push_front(Resident {
                    key: key.to_string(),
                    value,
                });
                self.index.insert(key.to_string(), Location::T1(id));
                self.t1_bytes += cost;
            }
        }
        self.trim_ghosts();
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(Location::T1(id)) => {
                if let Some(entry) = self.t1.remove(id) {
                    self.t1_bytes -= entry_cost(&entry.key, &entry.value);
                    self.fire(&entry.key, &entry.value);
                }
                true
            }
            Some(Location::T2(id)) => {
                if let Some(entry) = self.t2.remove(id) {
                    self.t2_bytes -= entry_cost(&entry.key, &entry.value);
                    self.fire(&entry.key, &entry.value);
                }
                true
            }
            Some(Location::B1(id)) => {
                if let Some(ghost) = self.b1.remove(id) {
                    self.b1_bytes -= ghost.cost;
                }
                false
            }
            Some(Location::B2(id)) => {
                if let Some(ghost) = self.b2.remove(id) {
                    self.b2_bytes -= ghost.cost;
                }
                false
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn bytes(&self) -> u64 {
        self.t1_bytes + self.t2_bytes
    }
}
