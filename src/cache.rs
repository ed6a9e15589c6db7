//! Historical snapshot cache
//!
//! Holds at most one ledger snapshot, keyed by its root. Building a
//! snapshot for a different root replaces the cached one.

use crate::history::Snapshot;

#[derive(Default)]
pub struct SnapshotCache {
    snapshot: Option<Snapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self { snapshot: None }
    }

    /// The cached snapshot if it was built for `root`.
    pub fn get(&self, root: &str) -> Option<&Snapshot> {
        self.snapshot.as_ref().filter(|s| s.root() == root)
    }

    pub fn contains(&self, root: &str) -> bool {
        self.get(root).is_some()
    }

    /// Cache `snapshot`, dropping whatever was cached before.
    pub fn store(&mut self, snapshot: Snapshot) -> &Snapshot {
        self.snapshot.insert(snapshot)
    }

    pub fn clear(&mut self) {
        self.snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryState;

    #[test]
    fn test_holds_a_single_snapshot() {
        let mut cache = SnapshotCache::new();
        let genesis = Snapshot::new(MemoryState::genesis("10", "20").unwrap()).unwrap();
        let other = Snapshot::new(MemoryState::genesis("11", "20").unwrap()).unwrap();
        let (root_a, root_b) = (genesis.root().to_string(), other.root().to_string());
        assert_ne!(root_a, root_b);

        assert!(!cache.contains(&root_a));
        cache.store(genesis);
        assert!(cache.contains(&root_a));

        // A new target evicts the old one
        cache.store(other);
        assert!(!cache.contains(&root_a));
        assert_eq!(cache.get(&root_b).map(|s| s.root()), Some(root_b.as_str()));

        cache.clear();
        assert!(cache.get(&root_b).is_none());
    }
}
