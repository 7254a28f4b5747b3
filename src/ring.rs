//! Consistent-hash ring of peer addresses with virtual nodes.
//!
//! Each peer contributes `replicas` virtual nodes, hashed as `"{i}{peer}"`.
//! The ring itself is an immutable sorted vector searched with
//! `partition_point`; `set` builds a fresh snapshot and swaps it in behind a
//! short write lock, so lookups never block on a rebuild and in-flight
//! operations keep the view they started with.

use std::sync::Arc;

use parking_lot::RwLock;

/// Hash function mapping bytes onto the ring. Must be deterministic across
/// processes, or peers would disagree on key ownership.
pub type HashFn = fn(&[u8]) -> u32;

/// Default virtual nodes per peer.
pub const DEFAULT_REPLICAS: usize = 50;

// CRC32 (IEEE, reflected polynomial 0xEDB88320), the default ring hash.
// Implemented here rather than pulled in as a dependency: the algorithm is
// pinned by the wire-compatibility requirement and fits in a page.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC32-IEEE checksum of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}

#[derive(Debug, Default)]
struct RingView {
    // sorted by (hash, peer); peer tie-break keeps rebuilds deterministic
    entries: Vec<(u32, Arc<str>)>,
}

#[derive(Debug)]
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    view: RwLock<Arc<RingView>>,
}

impl HashRing {
    /// Ring with the default CRC32 hash.
    pub fn new(replicas: usize) -> Self {
        Self::with_hash(replicas, crc32)
    }

    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        Self {
            replicas: replicas.max(1),
            hash,
            view: RwLock::new(Arc::new(RingView::default())),
        }
    }

    /// Atomically replaces the ring contents with virtual nodes for `peers`.
    ///
    /// The same peer list (in any order, with duplicates) always produces the
    /// same ring.
    pub fn set(&self, peers: &[String]) {
        let mut unique: Vec<&str> = peers.iter().map(String::as_str).collect();
        unique.sort_unstable();
        unique.dedup();

        let mut entries = Vec::with_capacity(unique.len() * self.replicas);
        for peer in unique {
            let shared: Arc<str> = Arc::from(peer);
            for i in 0..self.replicas {
                let vnode = format!("{i}{peer}");
                entries.push(((self.hash)(vnode.as_bytes()), shared.clone()));
            }
        }
        entries.sort_unstable_by(|a, b| (a.0, a.1.as_ref()).cmp(&(b.0, b.1.as_ref())));
        entries.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);

        *self.view.write() = Arc::new(RingView { entries });
    }

    /// Maps `key` to its owning peer; `None` when the ring is empty.
    pub fn pick(&self, key: &str) -> Option<Arc<str>> {
        let view = self.view.read().clone();
        if view.entries.is_empty() {
            return None;
        }
        let h = (self.hash)(key.as_bytes());
        let idx = view.entries.partition_point(|(eh, _)| *eh < h);
        let idx = if idx == view.entries.len() { 0 } else { idx };
        Some(view.entries[idx].1.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.view.read().entries.is_empty()
    }

    /// Distinct peer addresses currently on the ring.
    pub fn peers(&self) -> Vec<Arc<str>> {
        let view = self.view.read().clone();
        let mut peers: Vec<Arc<str>> = view.entries.iter().map(|(_, p)| p.clone()).collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_ieee_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn empty_ring_picks_nothing() {
        let ring = HashRing::new(50);
        assert!(ring.is_empty());
        assert_eq!(ring.pick("k"), None);
    }

    #[test]
    fn rebuild_with_same_peers_is_stable() {
        let peers = vec![
            "10.0.0.1:9001".to_string(),
            "10.0.0.2:9001".to_string(),
            "10.0.0.3:9001".to_string(),
        ];
        let ring = HashRing::new(50);
        ring.set(&peers);
        let before: Vec<_> = (0..200).map(|i| ring.pick(&format!("key-{i}")).unwrap()).collect();

        // same membership, shuffled and duplicated
        let mut shuffled = peers.clone();
        shuffled.reverse();
        shuffled.push(peers[0].clone());
        ring.set(&shuffled);
        let after: Vec<_> = (0..200).map(|i| ring.pick(&format!("key-{i}")).unwrap()).collect();

        assert_eq!(before, after);
    }

    #[test]
    fn adding_a_peer_moves_a_minority_of_keys() {
        let mut peers: Vec<String> = (1..=4).map(|i| format!("10.0.0.{i}:9001")).collect();
        let ring = HashRing::new(50);
        ring.set(&peers);
        let before: Vec<_> = (0..500).map(|i| ring.pick(&format!("key-{i}")).unwrap()).collect();

        peers.push("10.0.0.5:9001".to_string());
        ring.set(&peers);
        let moved = (0..500)
            .filter(|i| ring.pick(&format!("key-{i}")).unwrap() != before[*i as usize])
            .count();

        // expectation is ~1/5; assert well under half as a robust bound
        assert!(moved < 250, "moved {moved} of 500 keys");
    }

    #[test]
    fn single_peer_owns_everything() {
        let ring = HashRing::new(50);
        ring.set(&["10.0.0.1:9001".to_string()]);
        for i in 0..50 {
            assert_eq!(
                ring.pick(&format!("key-{i}")).unwrap().as_ref(),
                "10.0.0.1:9001"
            );
        }
    }

    #[test]
    fn peers_lists_distinct_members() {
        let ring = HashRing::new(10);
        ring.set(&[
            "b:1".to_string(),
            "a:1".to_string(),
            "a:1".to_string(),
        ]);
        let peers = ring.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].as_ref(), "a:1");
        assert_eq!(peers[1].as_ref(), "b:1");
    }

    #[test]
    fn wraparound_picks_first_entry() {
        // With one peer and an identity-ish hash we can't force wraparound
        // deterministically, so use a custom hash that maps the key above
        // every virtual node.
        fn high_hash(bytes: &[u8]) -> u32 {
            if bytes.starts_with(b"key") {
                u32::MAX
            } else {
                crc32(bytes) % 1000
            }
        }
        let ring = HashRing::with_hash(3, high_hash);
        ring.set(&["p1:1".to_string(), "p2:1".to_string()]);
        // key hashes beyond the last vnode: wraps to the ring's first entry
        let picked = ring.pick("key").unwrap();
        let first = {
            let view = ring.view.read().clone();
            view.entries[0].1.clone()
        };
        assert_eq!(picked, first);
    }
}
