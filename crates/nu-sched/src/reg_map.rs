//! Register-keyed maps for the DAG builder
//!
//! The builder clears its maps after every region, and regions are usually
//! much smaller than the register file. A sparse/dense pair makes membership
//! O(1) and `clear()` proportional to the number of populated keys instead of
//! the key universe.

use crate::dag::NodeId;
use crate::mir::Reg;

/// Set of small integer keys below a fixed universe.
///
/// `sparse[k]` points into `dense`; the entry is only trusted when the dense
/// slot points back at `k`, so `sparse` never needs to be reset.
#[derive(Debug, Clone, Default)]
pub struct SparseSet {
    sparse: Vec<u32>,
    dense: Vec<u32>,
}

impl SparseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the universe to at least `n` keys
    pub fn set_universe(&mut self, n: usize) {
        if n > self.sparse.len() {
            self.sparse.resize(n, 0);
        }
    }

    pub fn universe(&self) -> usize {
        self.sparse.len()
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    pub fn contains(&self, key: usize) -> bool {
        match self.sparse.get(key) {
            Some(&slot) => self.dense.get(slot as usize) == Some(&(key as u32)),
            None => false,
        }
    }

    /// Insert `key`; returns false if it was already present
    pub fn insert(&mut self, key: usize) -> bool {
        assert!(
            key < self.sparse.len(),
            "key {} outside universe of {}",
            key,
            self.sparse.len()
        );
        if self.contains(key) {
            return false;
        }
        self.sparse[key] = self.dense.len() as u32;
        self.dense.push(key as u32);
        true
    }

    /// Remove `key`; returns false if it was absent
    pub fn remove(&mut self, key: usize) -> bool {
        if !self.contains(key) {
            return false;
        }
        let slot = self.sparse[key] as usize;
        self.dense.swap_remove(slot);
        if let Some(&moved) = self.dense.get(slot) {
            self.sparse[moved as usize] = slot as u32;
        }
        true
    }

    pub fn clear(&mut self) {
        self.dense.clear();
    }

    /// Populated keys in insertion order (until a removal reorders them)
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.dense.iter().map(|&k| k as usize)
    }
}

/// A value that can be emptied in place so its storage is reused
pub trait Slot: Default {
    fn reset(&mut self);
}

impl<T> Slot for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Slot for Option<T> {
    fn reset(&mut self) {
        *self = None;
    }
}

/// Map from small integer keys to values, with `SparseSet` membership
#[derive(Debug, Clone)]
pub struct SparseMap<V: Slot> {
    keys: SparseSet,
    values: Vec<V>,
}

impl<V: Slot> Default for SparseMap<V> {
    fn default() -> Self {
        Self {
            keys: SparseSet::new(),
            values: Vec::new(),
        }
    }
}

impl<V: Slot> SparseMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the key universe to at least `n`
    pub fn set_limit(&mut self, n: usize) {
        self.keys.set_universe(n);
        if self.values.len() < n {
            self.values.resize_with(n, V::default);
        }
    }

    pub fn limit(&self) -> usize {
        self.keys.universe()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: usize) -> bool {
        self.keys.contains(key)
    }

    pub fn get(&self, key: usize) -> Option<&V> {
        if self.keys.contains(key) {
            Some(&self.values[key])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        if self.keys.contains(key) {
            Some(&mut self.values[key])
        } else {
            None
        }
    }

    /// Value for `key`, inserting an empty one first if needed
    pub fn entry(&mut self, key: usize) -> &mut V {
        if self.keys.insert(key) {
            self.values[key].reset();
        }
        &mut self.values[key]
    }

    pub fn erase(&mut self, key: usize) {
        if self.keys.remove(key) {
            self.values[key].reset();
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.keys.iter()
    }

    /// Empty every populated value and forget the keys
    pub fn clear(&mut self) {
        for key in self.keys.iter() {
            self.values[key].reset();
        }
        self.keys.clear();
    }
}

/// Physical register → list of nodes, keyed by register number.
#[derive(Debug, Clone, Default)]
pub struct RegNodeMap {
    map: SparseMap<Vec<NodeId>>,
}

impl RegNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the map for registers numbered below `n`
    pub fn set_limit(&mut self, n: usize) {
        self.map.set_limit(n);
    }

    pub fn limit(&self) -> usize {
        self.map.limit()
    }

    fn key(&self, reg: Reg) -> usize {
        let key = reg.0 as usize;
        assert!(
            key < self.map.limit(),
            "register {} outside tracked range of {}",
            reg,
            self.map.limit()
        );
        key
    }

    pub fn push(&mut self, reg: Reg, node: NodeId) {
        let key = self.key(reg);
        self.map.entry(key).push(node);
    }

    /// Nodes recorded for `reg`; empty when the register was never recorded
    pub fn get(&self, reg: Reg) -> &[NodeId] {
        let key = self.key(reg);
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_mut(&mut self, reg: Reg) -> &mut Vec<NodeId> {
        let key = self.key(reg);
        self.map.entry(key)
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.map.contains(self.key(reg))
    }

    pub fn erase(&mut self, reg: Reg) {
        let key = self.key(reg);
        self.map.erase(key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn registers(&self) -> impl Iterator<Item = Reg> + '_ {
        self.map.keys().map(|k| Reg(k as u32))
    }

    pub fn for_each_registered(&self, mut f: impl FnMut(Reg, &[NodeId])) {
        for key in self.map.keys() {
            if let Some(nodes) = self.map.get(key) {
                f(Reg(key as u32), nodes);
            }
        }
    }
}

/// Defs and uses of physical registers seen so far in a backward walk
#[derive(Debug, Clone, Default)]
pub struct RegUseDefs {
    pub defs: RegNodeMap,
    pub uses: RegNodeMap,
}

impl RegUseDefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limit(&mut self, n: usize) {
        self.defs.set_limit(n);
        self.uses.set_limit(n);
    }

    pub fn record_use(&mut self, reg: Reg, node: NodeId) {
        self.uses.push(reg, node);
    }

    pub fn record_def(&mut self, reg: Reg, node: NodeId) {
        self.defs.push(reg, node);
    }

    pub fn clear(&mut self) {
        self.defs.clear();
        self.uses.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty() && self.uses.is_empty()
    }

    /// Visit every register with recorded defs, then every register with
    /// recorded uses
    pub fn for_each_registered(&self, mut f: impl FnMut(Reg, &[NodeId], bool)) {
        self.defs.for_each_registered(|reg, nodes| f(reg, nodes, true));
        self.uses.for_each_registered(|reg, nodes| f(reg, nodes, false));
    }
}

/// Nearest later def of each virtual register, keyed by virtual index
pub type VRegDefMap = SparseMap<Option<NodeId>>;

/// Uses of each virtual register still waiting for their reaching def, as
/// `(node, operand index)`
pub type VRegUseMap = SparseMap<Vec<(NodeId, usize)>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_set_insert_remove() {
        let mut set = SparseSet::new();
        set.set_universe(16);

        assert!(set.insert(3));
        assert!(set.insert(9));
        assert!(!set.insert(3));
        assert!(set.contains(3) && set.contains(9));
        assert!(!set.contains(4));

        assert!(set.remove(3));
        assert!(!set.contains(3));
        assert!(set.contains(9));
        assert_eq!(set.len(), 1);

        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains(9));
        // Out of universe is simply absent
        assert!(!set.contains(100));
    }

    #[test]
    fn test_stale_sparse_entries_are_ignored() {
        let mut set = SparseSet::new();
        set.set_universe(8);
        set.insert(5);
        set.clear();
        set.insert(2);
        // sparse[5] still points at slot 0, which now holds key 2
        assert!(!set.contains(5));
        assert!(set.contains(2));
    }

    #[test]
    fn test_reg_node_map_basic() {
        let mut map = RegNodeMap::new();
        map.set_limit(32);

        map.push(Reg(4), NodeId(0));
        map.push(Reg(4), NodeId(2));
        map.push(Reg(7), NodeId(1));

        assert_eq!(map.get(Reg(4)), &[NodeId(0), NodeId(2)]);
        assert_eq!(map.get(Reg(5)), &[] as &[NodeId]);
        assert!(map.contains(Reg(7)));

        map.erase(Reg(7));
        assert!(!map.contains(Reg(7)));

        let mut seen = Vec::new();
        map.for_each_registered(|reg, nodes| seen.push((reg, nodes.len())));
        assert_eq!(seen, vec![(Reg(4), 2)]);
    }

    #[test]
    fn test_clear_resets_only_populated_and_reuses() {
        let mut map = RegNodeMap::new();
        map.set_limit(8);
        map.push(Reg(1), NodeId(0));
        map.clear();
        assert!(map.is_empty());

        // Re-inserting starts from an empty list, not the stale one
        map.push(Reg(1), NodeId(5));
        assert_eq!(map.get(Reg(1)), &[NodeId(5)]);
    }

    #[test]
    fn test_set_limit_is_idempotent() {
        let mut map = RegNodeMap::new();
        map.set_limit(8);
        map.push(Reg(3), NodeId(0));
        map.set_limit(4);
        assert_eq!(map.limit(), 8);
        assert_eq!(map.get(Reg(3)), &[NodeId(0)]);
    }

    #[test]
    #[should_panic(expected = "outside tracked range")]
    fn test_out_of_range_register_panics() {
        let mut map = RegNodeMap::new();
        map.set_limit(4);
        map.push(Reg(10), NodeId(0));
    }

    #[test]
    fn test_use_defs_tracker() {
        let mut tracker = RegUseDefs::new();
        tracker.set_limit(8);
        tracker.record_def(Reg(1), NodeId(0));
        tracker.record_use(Reg(2), NodeId(1));

        let mut visited = Vec::new();
        tracker.for_each_registered(|reg, _, is_def| visited.push((reg, is_def)));
        assert_eq!(visited, vec![(Reg(1), true), (Reg(2), false)]);

        tracker.clear();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_vreg_maps() {
        let mut defs = VRegDefMap::new();
        defs.set_limit(4);
        *defs.entry(2) = Some(NodeId(3));
        assert_eq!(defs.get(2), Some(&Some(NodeId(3))));
        assert_eq!(defs.get(1), None);

        let mut uses = VRegUseMap::new();
        uses.set_limit(4);
        uses.entry(0).push((NodeId(1), 2));
        uses.clear();
        assert!(uses.get(0).is_none());
        assert!(uses.entry(0).is_empty());
    }
}
