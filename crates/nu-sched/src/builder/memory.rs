//! Memory ordering state for the backward walk
//!
//! Every memory instruction seen so far (i.e. later in program order) is
//! reachable from this state, either directly or through the edges of a node
//! that is. An earlier memory instruction only has to be ordered against the
//! state, not against every later access.
//!
//! - `barrier_chain`: nearest later instruction that orders all memory
//! - `alias_chain`: nearest later store to an unknown object
//! - `pending_loads`: later loads from unknown objects
//! - per-object defs/uses, split by whether the object may be reached through
//!   other pointers
//! - `rejected`: nodes the alias oracle separated from an instruction that
//!   replaced them in the state; later instructions must still check them

use std::collections::{BTreeMap, HashSet};

use super::DagStats;
use crate::dag::{DepKind, NodeId, SchedDep, ScheduleDag};
use crate::mir::{MachineBlock, MachineInstr, MemObject};
use crate::options::SchedOptions;
use crate::target::{AliasOracle, AliasResult};

/// Latency of an order edge from a store to a later load
pub const STORE_LOAD_LATENCY: u32 = 1;

/// What the memory walk needs from the region being built
pub(crate) struct ChainCx<'c, 'a> {
    pub dag: &'c mut ScheduleDag,
    pub block: &'a MachineBlock,
    pub aa: Option<&'c dyn AliasOracle>,
    pub stats: &'c mut DagStats,
    max_depth: usize,
    max_rejected: usize,
    visited: HashSet<NodeId>,
}

impl<'c, 'a> ChainCx<'c, 'a> {
    pub fn new(
        dag: &'c mut ScheduleDag,
        block: &'a MachineBlock,
        aa: Option<&'c dyn AliasOracle>,
        options: &SchedOptions,
        stats: &'c mut DagStats,
    ) -> Self {
        Self {
            dag,
            block,
            aa,
            stats,
            max_depth: options.max_chain_depth,
            max_rejected: options.max_rejected,
            visited: HashSet::new(),
        }
    }

    fn mi(&self, id: NodeId) -> &'a MachineInstr {
        match self.dag.instr(id, self.block) {
            Some(mi) => mi,
            None => panic!("{} has no instruction", id),
        }
    }

    /// Order `su` before `target` unless the oracle separates them. Returns
    /// whether the edge was added.
    fn add_chain_dep(&mut self, su: NodeId, target: NodeId) -> bool {
        self.visited.clear();
        self.chain_dep(su, target, 0)
    }

    fn chain_dep(&mut self, su: NodeId, target: NodeId, depth: usize) -> bool {
        if su == target || !self.visited.insert(target) {
            return false;
        }
        let su_mi = self.mi(su);
        let target_mi = self.mi(target);

        if depth < self.max_depth && self.proven_disjoint(su_mi, target_mi) {
            self.stats.alias_edges_omitted += 1;
            log::trace!("no memory edge {} -> {}: no alias", su, target);

            // A store stands in for whatever it was ordered before; a load
            // never replaced anything in the state
            if target_mi.may_store() {
                let covered: Vec<NodeId> = self
                    .dag
                    .node(target)
                    .succs
                    .iter()
                    .filter(|d| d.kind == DepKind::Order && !d.node.is_exit())
                    .map(|d| d.node)
                    .collect();
                for next in covered {
                    let next_mi = self.mi(next);
                    if next_mi.is_global_memory_object() || !conflicts(su_mi, next_mi) {
                        continue;
                    }
                    self.chain_dep(su, next, depth + 1);
                }
            }
            return false;
        }

        let latency = order_latency(su_mi, target_mi);
        self.dag.add_dep(target, SchedDep::order(su, latency));
        true
    }

    fn proven_disjoint(&mut self, a: &MachineInstr, b: &MachineInstr) -> bool {
        let Some(aa) = self.aa else {
            return false;
        };
        if a.is_global_memory_object() || b.is_global_memory_object() {
            return false;
        }
        self.stats.alias_queries += 1;
        aa.alias(a, b) == AliasResult::NoAlias
    }
}

/// Store followed by a load waits for the store to complete
fn order_latency(earlier: &MachineInstr, later: &MachineInstr) -> u32 {
    if earlier.may_store() && later.may_load() {
        STORE_LOAD_LATENCY
    } else {
        0
    }
}

/// Whether two memory accesses need ordering at all
fn conflicts(a: &MachineInstr, b: &MachineInstr) -> bool {
    a.may_store() || b.may_store()
}

/// Whether two accesses can touch the same memory, judging only by their
/// identified objects
fn may_touch(a: &MachineInstr, b: &MachineInstr) -> bool {
    match (a.underlying_object(), b.underlying_object()) {
        (Some(x), Some(y)) => x.id == y.id,
        (Some(obj), None) | (None, Some(obj)) => obj.may_alias,
        (None, None) => true,
    }
}

/// Whether later accesses that can touch `node` reach it through `mi` once
/// `mi` is ordered before it. An unknown store becomes the alias chain and a
/// store to an identified object becomes that object's def.
fn covers(mi: &MachineInstr, node: &MachineInstr) -> bool {
    if !mi.may_store() {
        return false;
    }
    match mi.underlying_object() {
        None => true,
        Some(obj) => node.underlying_object() == Some(obj),
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryChains {
    barrier_chain: Option<NodeId>,
    alias_chain: Option<NodeId>,
    pending_loads: Vec<NodeId>,
    alias_defs: BTreeMap<MemObject, NodeId>,
    alias_uses: BTreeMap<MemObject, Vec<NodeId>>,
    non_alias_defs: BTreeMap<MemObject, NodeId>,
    non_alias_uses: BTreeMap<MemObject, Vec<NodeId>>,
    rejected: Vec<NodeId>,
}

impl MemoryChains {
    pub fn clear(&mut self) {
        self.barrier_chain = None;
        self.alias_chain = None;
        self.pending_loads.clear();
        self.alias_defs.clear();
        self.alias_uses.clear();
        self.non_alias_defs.clear();
        self.non_alias_uses.clear();
        self.rejected.clear();
    }

    /// Add the memory edges of `su` and fold it into the state
    pub fn add_deps(&mut self, cx: &mut ChainCx<'_, '_>, su: NodeId, mi: &MachineInstr) {
        if mi.is_global_memory_object() {
            self.add_global_deps(cx, su);
        } else if mi.may_store() {
            self.add_store_deps(cx, su, mi);
        } else if mi.may_load() {
            self.add_load_deps(cx, su, mi);
        }
    }

    fn add_global_deps(&mut self, cx: &mut ChainCx<'_, '_>, su: NodeId) {
        let mut targets: Vec<NodeId> = Vec::new();
        targets.extend(self.barrier_chain);
        targets.extend(self.alias_chain);
        targets.extend(self.pending_loads.iter().copied());
        targets.extend(self.alias_defs.values().copied());
        targets.extend(self.alias_uses.values().flatten().copied());
        targets.extend(self.non_alias_defs.values().copied());
        targets.extend(self.non_alias_uses.values().flatten().copied());
        targets.extend(self.rejected.iter().copied());

        for target in targets {
            cx.add_chain_dep(su, target);
        }

        self.clear();
        self.barrier_chain = Some(su);
        self.alias_chain = Some(su);
    }

    fn add_store_deps(&mut self, cx: &mut ChainCx<'_, '_>, su: NodeId, mi: &MachineInstr) {
        match mi.underlying_object() {
            Some(obj) => {
                let (defs, uses) = if obj.may_alias {
                    (&mut self.alias_defs, &mut self.alias_uses)
                } else {
                    (&mut self.non_alias_defs, &mut self.non_alias_uses)
                };
                let mut dropped = Vec::new();
                if let Some(def) = defs.insert(obj, su)
                    && !cx.add_chain_dep(su, def)
                {
                    dropped.push(def);
                }
                for user in uses.remove(&obj).unwrap_or_default() {
                    if !cx.add_chain_dep(su, user) {
                        dropped.push(user);
                    }
                }
                if obj.may_alias {
                    for i in 0..self.pending_loads.len() {
                        cx.add_chain_dep(su, self.pending_loads[i]);
                    }
                    if let Some(chain) = self.alias_chain {
                        cx.add_chain_dep(su, chain);
                    }
                }
                self.check_rejected(cx, su, mi);
                for node in dropped {
                    self.reject(node);
                }
            }
            None => {
                // Unknown store: becomes the new alias chain
                let mut targets: Vec<NodeId> = Vec::new();
                targets.extend(self.alias_chain);
                targets.append(&mut self.pending_loads);
                targets.extend(std::mem::take(&mut self.alias_defs).into_values());
                targets.extend(std::mem::take(&mut self.alias_uses).into_values().flatten());

                self.check_rejected(cx, su, mi);
                for target in targets {
                    if !cx.add_chain_dep(su, target) {
                        self.reject(target);
                    }
                }
                self.alias_chain = Some(su);
            }
        }

        if let Some(barrier) = self.barrier_chain {
            cx.dag.add_dep(barrier, SchedDep::order(su, 0));
        }
        cx.dag.add_dep(NodeId::EXIT, SchedDep::artificial(su, 0));
    }

    fn add_load_deps(&mut self, cx: &mut ChainCx<'_, '_>, su: NodeId, mi: &MachineInstr) {
        if mi.is_invariant_load() {
            return;
        }

        match mi.underlying_object() {
            Some(obj) => {
                let (defs, uses) = if obj.may_alias {
                    (&self.alias_defs, &mut self.alias_uses)
                } else {
                    (&self.non_alias_defs, &mut self.non_alias_uses)
                };
                if let Some(&def) = defs.get(&obj) {
                    cx.add_chain_dep(su, def);
                }
                uses.entry(obj).or_default().push(su);
                if obj.may_alias
                    && let Some(chain) = self.alias_chain
                {
                    cx.add_chain_dep(su, chain);
                }
            }
            None => {
                let defs: Vec<NodeId> = self.alias_defs.values().copied().collect();
                for def in defs {
                    cx.add_chain_dep(su, def);
                }
                if let Some(chain) = self.alias_chain {
                    cx.add_chain_dep(su, chain);
                }
                self.pending_loads.push(su);
            }
        }

        self.check_rejected(cx, su, mi);
        if let Some(barrier) = self.barrier_chain {
            cx.dag.add_dep(barrier, SchedDep::order(su, 0));
        }
    }

    /// Order `su` against nodes an earlier oracle answer left out of the state
    fn check_rejected(&mut self, cx: &mut ChainCx<'_, '_>, su: NodeId, mi: &MachineInstr) {
        if self.rejected.is_empty() {
            return;
        }

        if self.rejected.len() > cx.max_rejected && mi.may_store() {
            log::trace!(
                "{} rejected memory nodes, ordering {} against all of them",
                self.rejected.len(),
                su
            );
            for node in std::mem::take(&mut self.rejected) {
                let other = cx.mi(node);
                cx.dag.add_dep(node, SchedDep::order(su, order_latency(mi, other)));
                if !covers(mi, other) {
                    self.rejected.push(node);
                }
            }
            return;
        }

        let mut keep = Vec::with_capacity(self.rejected.len());
        for node in std::mem::take(&mut self.rejected) {
            let other = cx.mi(node);
            if !conflicts(mi, other) || !may_touch(mi, other) {
                keep.push(node);
                continue;
            }
            if !(cx.add_chain_dep(su, node) && covers(mi, other)) {
                keep.push(node);
            }
        }
        self.rejected = keep;
    }

    fn reject(&mut self, node: NodeId) {
        if !self.rejected.contains(&node) {
            self.rejected.push(node);
        }
    }
}
