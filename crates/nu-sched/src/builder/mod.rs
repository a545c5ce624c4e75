//! Schedule DAG construction
//!
//! `DagBuilder` turns one scheduling region into a [`ScheduleDag`] with a
//! single walk from the bottom of the region to the top. While walking it
//! keeps, for every register and memory location, the nodes that touch it
//! later in program order; each instruction is then linked to those nodes and
//! replaces them where it hides them from earlier instructions.
//!
//! ## Edges
//!
//! Every edge points from the earlier instruction to the later one:
//! - data: def, then a use of the same (or an overlapping) register
//! - anti: use, then a def
//! - output: def, then another def
//! - order: memory ordering and scheduling barriers
//! - artificial: stores are kept ahead of the region exit
//!
//! The region's exit pseudo node reads whatever the code after the region
//! needs, so the last def of each such register gets a data edge to it.
//!
//! Builder state is reset before and after every region; one builder serves
//! every region of a function.

mod memory;

pub use memory::STORE_LOAD_LATENCY;

use memory::{ChainCx, MemoryChains};

use crate::cfg::{DominatorTree, LoopInfo};
use crate::dag::{DepKind, NodeId, SchedDep, ScheduleDag};
use crate::loop_deps::LoopDependencies;
use crate::mir::{MachineBlock, MachineFunction, MachineInstr, Reg};
use crate::options::SchedOptions;
use crate::reg_map::{RegUseDefs, VRegDefMap, VRegUseMap};
use crate::region::SchedRegion;
use crate::target::{AliasOracle, RegisterInfo, TimingModel};

/// Counters accumulated over every region a builder has built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagStats {
    pub regions: usize,
    pub nodes: usize,
    pub data_edges: usize,
    pub anti_edges: usize,
    pub output_edges: usize,
    pub order_edges: usize,
    pub artificial_edges: usize,
    /// Questions asked of the alias oracle
    pub alias_queries: usize,
    /// Memory edges left out because the oracle ruled out aliasing
    pub alias_edges_omitted: usize,
    /// Exit edges adjusted by loop-carried dependencies
    pub loop_hints: usize,
}

impl DagStats {
    pub fn edges(&self) -> usize {
        self.data_edges
            + self.anti_edges
            + self.output_edges
            + self.order_edges
            + self.artificial_edges
    }

    fn record(&mut self, dag: &ScheduleDag) {
        self.regions += 1;
        self.nodes += dag.len();
        for (kind, count) in dag.edge_counts() {
            match kind {
                DepKind::Data => self.data_edges += count,
                DepKind::Anti => self.anti_edges += count,
                DepKind::Output => self.output_edges += count,
                DepKind::Order => self.order_edges += count,
                DepKind::Artificial => self.artificial_edges += count,
            }
        }
    }
}

/// Dominator tree and loops of the function being scheduled
#[derive(Debug, Clone, Copy)]
pub struct LoopContext<'a> {
    pub domtree: &'a DominatorTree,
    pub loops: &'a LoopInfo,
}

/// Scheduling barriers seen so far in the walk
#[derive(Debug, Default)]
struct BarrierState {
    /// Nearest later barrier
    last: Option<NodeId>,
    /// Nodes between the current position and `last`
    since: Vec<NodeId>,
}

pub struct DagBuilder<'a> {
    func: &'a MachineFunction,
    regs: &'a dyn RegisterInfo,
    timing: &'a dyn TimingModel,
    loops: Option<LoopContext<'a>>,
    options: SchedOptions,

    tracker: RegUseDefs,
    vreg_defs: VRegDefMap,
    vreg_uses: VRegUseMap,
    memory: MemoryChains,
    loop_regs: LoopDependencies,

    region: Option<SchedRegion>,
    block: Option<&'a MachineBlock>,
    stats: DagStats,
}

impl<'a> DagBuilder<'a> {
    pub fn new(
        func: &'a MachineFunction,
        regs: &'a dyn RegisterInfo,
        timing: &'a dyn TimingModel,
        options: SchedOptions,
    ) -> Self {
        Self {
            func,
            regs,
            timing,
            loops: None,
            options,
            tracker: RegUseDefs::new(),
            vreg_defs: VRegDefMap::new(),
            vreg_uses: VRegUseMap::new(),
            memory: MemoryChains::default(),
            loop_regs: LoopDependencies::new(),
            region: None,
            block: None,
            stats: DagStats::default(),
        }
    }

    /// Enable loop-carried latency hints
    pub fn with_loops(mut self, domtree: &'a DominatorTree, loops: &'a LoopInfo) -> Self {
        self.loops = Some(LoopContext { domtree, loops });
        self
    }

    pub fn options(&self) -> &SchedOptions {
        &self.options
    }

    pub fn stats(&self) -> &DagStats {
        &self.stats
    }

    pub fn func(&self) -> &'a MachineFunction {
        self.func
    }

    /// Loop-carried dependencies found for the current region
    pub fn loop_dependencies(&self) -> &LoopDependencies {
        &self.loop_regs
    }

    /// Prepare to build `region`
    pub fn initialize(&mut self, region: SchedRegion) {
        let block = self.func.block(region.block);
        assert!(
            region.begin <= region.end && region.end <= block.instrs.len(),
            "region {} out of range for {} instructions",
            region,
            block.instrs.len()
        );

        self.reset();
        self.tracker.set_limit(self.regs.num_regs());
        let num_vregs = self.func.num_virt_regs as usize;
        self.vreg_defs.set_limit(num_vregs);
        self.vreg_uses.set_limit(num_vregs);

        if self.options.analyze_loops
            && let Some(cx) = self.loops
            && let Some(lp) = cx.loops.loop_for(region.block)
        {
            self.loop_regs.visit_loop(self.func, cx.domtree, lp);
        }

        self.region = Some(region);
        self.block = Some(block);
    }

    /// Build the DAG of the region passed to [`initialize`](Self::initialize)
    pub fn build(&mut self, aa: Option<&dyn AliasOracle>) -> ScheduleDag {
        let (Some(region), Some(block)) = (self.region.take(), self.block) else {
            panic!("build called before initialize");
        };

        let mut dag = ScheduleDag::new(region.block, region.begin, region.end);
        let node_of = self.init_nodes(&mut dag, block, &region);
        record_dbg_values(&mut dag, block, &region);

        self.add_sched_barrier_deps(&mut dag, block, &region);

        let mut barriers = BarrierState::default();
        for idx in (region.begin..region.end).rev() {
            let Some(su) = node_of[idx - region.begin] else {
                continue;
            };
            let mi = &block.instrs[idx];

            for (op_idx, op) in mi.reg_operands() {
                if op.is_def {
                    self.add_reg_def(&mut dag, block, su, mi, op_idx);
                }
            }
            for (op_idx, op) in mi.reg_operands() {
                if op.reads_reg() {
                    self.add_reg_use(&mut dag, su, mi, op_idx);
                }
            }

            if mi.is_barrier() {
                self.add_barrier_deps(&mut dag, &mut barriers, su, mi);
            } else {
                if let Some(barrier) = barriers.last {
                    dag.add_dep(barrier, SchedDep::order(su, 0));
                }
                barriers.since.push(su);
            }

            let mut cx = ChainCx::new(&mut dag, block, aa, &self.options, &mut self.stats);
            self.memory.add_deps(&mut cx, su, mi);
        }

        self.reset();
        self.stats.record(&dag);
        log::debug!(
            "built {}: {} nodes, {} edges",
            dag.dag_name(),
            dag.len(),
            dag.num_edges()
        );
        dag
    }

    /// `initialize` followed by `build`
    pub fn build_region(
        &mut self,
        region: SchedRegion,
        aa: Option<&dyn AliasOracle>,
    ) -> ScheduleDag {
        self.initialize(region);
        self.build(aa)
    }

    fn reset(&mut self) {
        self.tracker.clear();
        self.vreg_defs.clear();
        self.vreg_uses.clear();
        self.memory.clear();
        self.loop_regs.clear();
        self.region = None;
        self.block = None;
    }

    /// One node per real instruction, numbered in program order
    fn init_nodes(
        &self,
        dag: &mut ScheduleDag,
        block: &MachineBlock,
        region: &SchedRegion,
    ) -> Vec<Option<NodeId>> {
        let mut node_of = vec![None; region.len()];
        for idx in region.begin..region.end {
            let mi = &block.instrs[idx];
            if mi.is_debug_value() {
                continue;
            }
            assert!(
                !mi.is_terminator() && !mi.is_label(),
                "cannot schedule `{}` inside a region",
                mi
            );
            let id = dag.new_node(idx);
            dag.node_mut(id).is_call = mi.is_call();
            self.compute_latency(dag, id);
            node_of[idx - region.begin] = Some(id);
        }
        node_of
    }

    /// Make the exit node read what the code after the region reads: the
    /// boundary instruction's operands and, unless the boundary is a call,
    /// every register live into a successor block.
    fn add_sched_barrier_deps(
        &mut self,
        dag: &mut ScheduleDag,
        block: &MachineBlock,
        region: &SchedRegion,
    ) {
        let exit_mi = block.instrs.get(region.end);
        if exit_mi.is_some() {
            dag.exit.instr = Some(region.end);
        }

        if let Some(mi) = exit_mi {
            for (op_idx, op) in mi.reg_operands() {
                if !op.reads_reg() {
                    continue;
                }
                if self.regs.is_physical(op.reg) {
                    self.record_exit_use(op.reg);
                } else if op.reg.is_virtual() {
                    assert!(
                        !self.options.post_ra,
                        "virtual register {} after register allocation",
                        op.reg
                    );
                    self.vreg_uses
                        .entry(op.reg.virt_index())
                        .push((NodeId::EXIT, op_idx));
                }
            }
        }

        if !exit_mi.is_some_and(MachineInstr::is_call) {
            for &succ in &block.successors {
                for &reg in &self.func.block(succ).live_ins {
                    if self.regs.is_physical(reg) {
                        self.record_exit_use(reg);
                    }
                }
            }
        }
    }

    fn record_exit_use(&mut self, reg: Reg) {
        if !self.tracker.uses.get(reg).contains(&NodeId::EXIT) {
            self.tracker.record_use(reg, NodeId::EXIT);
        }
    }

    /// Default latency of a node
    pub fn compute_latency(&self, dag: &mut ScheduleDag, id: NodeId) {
        let latency = if self.options.unit_latencies {
            1
        } else {
            let block = self.block_of(dag);
            match dag.instr(id, block) {
                Some(mi) => self.timing.instr_latency(mi),
                None => 0,
            }
        };
        dag.node_mut(id).latency = latency;
    }

    /// Refine the latency of a data edge from `def` to `user` using operand
    /// timing. Edges into the exit node may be shortened by loop-carried
    /// dependencies instead.
    pub fn compute_operand_latency(
        &mut self,
        dag: &mut ScheduleDag,
        def: NodeId,
        user: NodeId,
        dep: &mut SchedDep,
    ) {
        if self.options.unit_latencies || dep.kind != DepKind::Data {
            return;
        }
        let Some(reg) = dep.reg else {
            return;
        };
        let block = self.block_of(dag);
        let Some(def_mi) = dag.instr(def, block) else {
            return;
        };
        let Some(def_idx) = dep.def_operand.or_else(|| def_mi.find_def_operand(reg)) else {
            return;
        };

        let use_mi = if user.is_exit() {
            None
        } else {
            dag.instr(user, block)
        };
        match use_mi {
            None => {
                if !self.apply_loop_hint(dag, def, reg, dep)
                    && let Some(cycle) = self.timing.def_operand_cycle(def_mi, def_idx)
                {
                    dep.latency = cycle;
                }
            }
            Some(use_mi) => {
                let best = use_mi
                    .reg_operands()
                    .filter(|(_, op)| op.reads_reg() && op.reg == reg)
                    .filter_map(|(use_idx, _)| {
                        self.timing.operand_latency(def_mi, def_idx, use_mi, use_idx)
                    })
                    .max();
                if let Some(latency) = best {
                    dep.latency = latency;
                }
            }
        }

        self.timing.adjust_dependency(def_mi, use_mi, dep);
    }

    /// A def whose value is only read by the next loop iteration: the reader
    /// sits `count` instructions into its block, so that much latency is
    /// already hidden. A reader feeding an address in this same block makes
    /// the def schedule high instead.
    fn apply_loop_hint(
        &mut self,
        dag: &mut ScheduleDag,
        def: NodeId,
        reg: Reg,
        dep: &mut SchedDep,
    ) -> bool {
        let Some(hint) = self.loop_regs.get(reg).copied() else {
            return false;
        };
        let use_mi = &self.func.block(hint.block).instrs[hint.instr];
        let feeds_address = use_mi.reg_operand(hint.operand).is_address
            && (use_mi.may_load() || use_mi.may_store());
        let special = self.timing.special_address_latency();

        if hint.block != dag.block {
            let mut latency = dag.node(def).latency;
            if feeds_address {
                latency += special;
            }
            latency -= latency.min(hint.count);
            dep.latency = latency;
        } else if special > 0 && feeds_address {
            dag.node_mut(def).is_schedule_high = true;
        } else {
            return false;
        }

        self.stats.loop_hints += 1;
        log::trace!(
            "loop-carried {} from {}: last read at {}:{}",
            reg,
            def,
            hint.block,
            hint.instr
        );
        true
    }

    fn block_of(&self, dag: &ScheduleDag) -> &'a MachineBlock {
        match self.block {
            Some(block) if block.id == dag.block => block,
            _ => self.func.block(dag.block),
        }
    }

    fn add_reg_def(
        &mut self,
        dag: &mut ScheduleDag,
        block: &MachineBlock,
        su: NodeId,
        mi: &MachineInstr,
        op_idx: usize,
    ) {
        let reg = mi.reg_operand(op_idx).reg;
        if self.regs.is_physical(reg) {
            self.add_phys_reg_def(dag, block, su, mi, op_idx);
        } else if reg.is_virtual() {
            assert!(!self.options.post_ra, "virtual register {} after register allocation", reg);
            self.add_vreg_def_deps(dag, su, mi, op_idx);
        }
    }

    fn add_reg_use(&mut self, dag: &mut ScheduleDag, su: NodeId, mi: &MachineInstr, op_idx: usize) {
        let reg = mi.reg_operand(op_idx).reg;
        if self.regs.is_physical(reg) {
            self.add_phys_reg_use(dag, su, reg);
        } else if reg.is_virtual() {
            assert!(!self.options.post_ra, "virtual register {} after register allocation", reg);
            self.add_vreg_use_deps(dag, su, reg, op_idx);
        }
    }

    fn add_phys_reg_def(
        &mut self,
        dag: &mut ScheduleDag,
        block: &MachineBlock,
        su: NodeId,
        mi: &MachineInstr,
        op_idx: usize,
    ) {
        let op = *mi.reg_operand(op_idx);
        let regs = self.regs;

        for &alias in regs.overlaps(op.reg) {
            for i in 0..self.tracker.defs.get(alias).len() {
                let later = self.tracker.defs.get(alias)[i];
                if later == su || later.is_exit() {
                    continue;
                }
                let Some(later_mi) = dag.instr(later, block) else {
                    continue;
                };
                // Two dead writes never need ordering
                if op.is_dead && later_mi.register_def_is_dead(alias) {
                    continue;
                }
                let latency = self.timing.output_latency(mi, op_idx, later_mi);
                dag.add_dep(later, SchedDep::output(su, latency, alias));
            }
        }

        self.add_phys_reg_data_deps(dag, block, su, mi, op_idx);

        // Earlier instructions see this def instead of the later reads
        self.tracker.uses.erase(op.reg);
        if !op.is_dead {
            self.tracker.defs.erase(op.reg);
        }
        let defs = self.tracker.defs.get_mut(op.reg);
        // Calls are chained through memory anyway; keep one at the back
        if dag.node(su).is_call {
            while let Some(&last) = defs.last() {
                if last.is_exit() || !dag.node(last).is_call {
                    break;
                }
                defs.pop();
            }
        }
        defs.push(su);
    }

    fn add_phys_reg_data_deps(
        &mut self,
        dag: &mut ScheduleDag,
        block: &MachineBlock,
        su: NodeId,
        mi: &MachineInstr,
        op_idx: usize,
    ) {
        let reg = mi.reg_operand(op_idx).reg;
        let regs = self.regs;
        let special = if self.options.unit_latencies {
            0
        } else {
            self.timing.special_address_latency()
        };

        for &alias in regs.overlaps(reg) {
            for i in 0..self.tracker.uses.get(alias).len() {
                let user = self.tracker.uses.get(alias)[i];
                if user == su {
                    continue;
                }
                let mut latency = dag.node(su).latency;
                let mut use_idx = None;
                if !user.is_exit()
                    && let Some(use_mi) = dag.instr(user, block)
                {
                    use_idx = use_mi.find_use_operand(alias);
                    if let Some(idx) = use_idx
                        && use_mi.reg_operand(idx).is_address
                        && (use_mi.may_load() || use_mi.may_store())
                    {
                        latency += special;
                    }
                }
                let mut dep =
                    SchedDep::data(su, latency, alias).with_operands(Some(op_idx), use_idx);
                self.compute_operand_latency(dag, su, user, &mut dep);
                dag.add_dep(user, dep);
            }
        }
    }

    fn add_phys_reg_use(&mut self, dag: &mut ScheduleDag, su: NodeId, reg: Reg) {
        let regs = self.regs;
        for &alias in regs.overlaps(reg) {
            for &later in self.tracker.defs.get(alias) {
                if later != su && !later.is_exit() {
                    dag.add_dep(later, SchedDep::anti(su, alias));
                }
            }
        }
        self.tracker.record_use(reg, su);
    }

    /// Resolve the pending reads of a virtual register and chain this def to
    /// the next one
    fn add_vreg_def_deps(
        &mut self,
        dag: &mut ScheduleDag,
        su: NodeId,
        mi: &MachineInstr,
        op_idx: usize,
    ) {
        let reg = mi.reg_operand(op_idx).reg;
        let key = reg.virt_index();

        let mut pending = std::mem::take(self.vreg_uses.entry(key));
        for &(user, use_idx) in &pending {
            if user == su {
                continue;
            }
            let latency = dag.node(su).latency;
            let mut dep =
                SchedDep::data(su, latency, reg).with_operands(Some(op_idx), Some(use_idx));
            self.compute_operand_latency(dag, su, user, &mut dep);
            dag.add_dep(user, dep);
        }
        pending.clear();
        *self.vreg_uses.entry(key) = pending;

        if let Some(later) = *self.vreg_defs.entry(key)
            && later != su
        {
            let block = self.block_of(dag);
            if let Some(later_mi) = dag.instr(later, block) {
                let latency = self.timing.output_latency(mi, op_idx, later_mi);
                dag.add_dep(later, SchedDep::output(su, latency, reg));
            }
        }
        *self.vreg_defs.entry(key) = Some(su);
    }

    fn add_vreg_use_deps(&mut self, dag: &mut ScheduleDag, su: NodeId, reg: Reg, op_idx: usize) {
        let key = reg.virt_index();
        if let Some(Some(later)) = self.vreg_defs.get(key).copied()
            && later != su
        {
            dag.add_dep(later, SchedDep::anti(su, reg));
        }
        self.vreg_uses.entry(key).push((su, op_idx));
    }

    /// Nothing moves across a barrier: order it before everything up to the
    /// next barrier and start register tracking over from its own operands.
    ///
    /// Direct edges only reach the nodes between this barrier and the next
    /// one, plus the next barrier itself. Nodes past the next barrier are
    /// ordered through the barrier chain, so `ScheduleDag::reaches` holds for
    /// every later node while `is_pred` may not.
    fn add_barrier_deps(
        &mut self,
        dag: &mut ScheduleDag,
        barriers: &mut BarrierState,
        su: NodeId,
        mi: &MachineInstr,
    ) {
        for &node in &barriers.since {
            dag.add_dep(node, SchedDep::order(su, 0));
        }
        if let Some(next) = barriers.last {
            dag.add_dep(next, SchedDep::order(su, 0));
        }
        barriers.since.clear();
        barriers.last = Some(su);

        let mut exit_reads = Vec::new();
        self.tracker.uses.for_each_registered(|reg, nodes| {
            if nodes.contains(&NodeId::EXIT) {
                exit_reads.push(reg);
            }
        });
        self.tracker.clear();
        for reg in exit_reads {
            self.tracker.record_use(reg, NodeId::EXIT);
        }
        for (_, op) in mi.reg_operands() {
            if !self.regs.is_physical(op.reg) {
                continue;
            }
            if op.is_def {
                self.tracker.record_def(op.reg, su);
            } else if op.reads_reg() {
                self.tracker.record_use(op.reg, su);
            }
        }
    }
}

/// Pair each debug value with the instruction right before it
fn record_dbg_values(dag: &mut ScheduleDag, block: &MachineBlock, region: &SchedRegion) {
    for idx in region.begin..region.end {
        if !block.instrs[idx].is_debug_value() {
            continue;
        }
        if idx == region.begin {
            dag.first_dbg_value = Some(idx);
        } else {
            dag.dbg_values.push((idx, idx - 1));
        }
    }
}
