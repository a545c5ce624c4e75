//! Scheduling DAG: nodes, dependence edges and graph queries
//!
//! One `SchedNode` wraps one machine instruction of a scheduling region; the
//! `exit` pseudo node stands for the region boundary. Edges are kept on both
//! ends: a node's `preds` must execute before it, its `succs` after it.
//!
//! Nodes live in an arena indexed by `NodeId` and never move once created.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::SchedError;
use crate::mir::{BlockId, InstrRef, MachineBlock, MachineInstr, Reg};

/// Index of a node in its region's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The region exit pseudo node
    pub const EXIT: NodeId = NodeId(u32::MAX);

    pub fn is_exit(self) -> bool {
        self == Self::EXIT
    }

    pub fn index(self) -> usize {
        assert!(!self.is_exit(), "the exit node has no arena index");
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_exit() {
            write!(f, "ExitSU")
        } else {
            write!(f, "SU({})", self.0)
        }
    }
}

/// Kind of dependence between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// Read after write
    Data,
    /// Write after read
    Anti,
    /// Write after write
    Output,
    /// Memory ordering or barrier ordering
    Order,
    /// Scheduling hint; not required for correctness
    Artificial,
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DepKind::Data => "data",
            DepKind::Anti => "anti",
            DepKind::Output => "out",
            DepKind::Order => "ord",
            DepKind::Artificial => "art",
        };
        write!(f, "{}", s)
    }
}

/// A dependence edge as seen from one of its ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedDep {
    /// Node at the other end
    pub node: NodeId,
    pub kind: DepKind,
    /// Cycles between issuing the predecessor and issuing the successor
    pub latency: u32,
    /// Register carrying a data/anti/output dependence
    pub reg: Option<Reg>,
    /// Operand of the predecessor that defines `reg` (data edges)
    pub def_operand: Option<usize>,
    /// Operand of the successor that reads `reg` (data edges)
    pub use_operand: Option<usize>,
}

impl SchedDep {
    pub fn new(node: NodeId, kind: DepKind, latency: u32) -> Self {
        Self {
            node,
            kind,
            latency,
            reg: None,
            def_operand: None,
            use_operand: None,
        }
    }

    pub fn data(node: NodeId, latency: u32, reg: Reg) -> Self {
        Self::new(node, DepKind::Data, latency).with_reg(reg)
    }

    pub fn anti(node: NodeId, reg: Reg) -> Self {
        Self::new(node, DepKind::Anti, 0).with_reg(reg)
    }

    pub fn output(node: NodeId, latency: u32, reg: Reg) -> Self {
        Self::new(node, DepKind::Output, latency).with_reg(reg)
    }

    pub fn order(node: NodeId, latency: u32) -> Self {
        Self::new(node, DepKind::Order, latency)
    }

    pub fn artificial(node: NodeId, latency: u32) -> Self {
        Self::new(node, DepKind::Artificial, latency)
    }

    pub fn with_reg(mut self, reg: Reg) -> Self {
        self.reg = Some(reg);
        self
    }

    pub fn with_operands(mut self, def_operand: Option<usize>, use_operand: Option<usize>) -> Self {
        self.def_operand = def_operand;
        self.use_operand = use_operand;
        self
    }

    pub fn is_artificial(&self) -> bool {
        self.kind == DepKind::Artificial
    }

    /// Two deps describe the same constraint (same node, kind and register)
    fn overlaps(&self, other: &SchedDep) -> bool {
        self.node == other.node && self.kind == other.kind && self.reg == other.reg
    }

    fn mirrored(&self, node: NodeId) -> SchedDep {
        SchedDep { node, ..*self }
    }
}

/// Scheduling unit
#[derive(Debug, Clone)]
pub struct SchedNode {
    pub id: NodeId,
    /// Instruction position in the block; `None` for an exit node at the end
    /// of the block
    pub instr: Option<InstrRef>,
    /// Default latency of the instruction
    pub latency: u32,
    pub is_call: bool,
    /// Should be scheduled as early as possible (loop-carried address feed)
    pub is_schedule_high: bool,
    pub preds: Vec<SchedDep>,
    pub succs: Vec<SchedDep>,
}

impl SchedNode {
    fn new(id: NodeId, instr: Option<InstrRef>) -> Self {
        Self {
            id,
            instr,
            latency: 0,
            is_call: false,
            is_schedule_high: false,
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    /// Whether `node` is a direct predecessor
    pub fn is_pred(&self, node: NodeId) -> bool {
        self.preds.iter().any(|d| d.node == node)
    }

    /// Whether `node` is a direct successor
    pub fn is_succ(&self, node: NodeId) -> bool {
        self.succs.iter().any(|d| d.node == node)
    }
}

/// Dependency graph of one scheduling region
#[derive(Debug, Clone)]
pub struct ScheduleDag {
    pub block: BlockId,
    /// First instruction of the region
    pub begin: InstrRef,
    /// One past the last instruction of the region
    pub end: InstrRef,
    pub nodes: Vec<SchedNode>,
    /// Region boundary pseudo node
    pub exit: SchedNode,
    /// Debug values paired with the instruction right before them
    pub dbg_values: Vec<(InstrRef, InstrRef)>,
    /// Debug value opening the region, if any
    pub first_dbg_value: Option<InstrRef>,
}

impl ScheduleDag {
    pub(crate) fn new(block: BlockId, begin: InstrRef, end: InstrRef) -> Self {
        Self {
            block,
            begin,
            end,
            nodes: Vec::new(),
            exit: SchedNode::new(NodeId::EXIT, None),
            dbg_values: Vec::new(),
            first_dbg_value: None,
        }
    }

    /// Allocate the node for the instruction at `instr`
    pub(crate) fn new_node(&mut self, instr: InstrRef) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(SchedNode::new(id, Some(instr)));
        id
    }

    /// Number of real (non-exit) nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &SchedNode {
        if id.is_exit() {
            &self.exit
        } else {
            &self.nodes[id.index()]
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SchedNode {
        if id.is_exit() {
            &mut self.exit
        } else {
            &mut self.nodes[id.index()]
        }
    }

    /// Node wrapping the instruction at `instr`
    pub fn node_for_instr(&self, instr: InstrRef) -> Option<NodeId> {
        self.nodes
            .binary_search_by_key(&Some(instr), |n| n.instr)
            .ok()
            .map(|i| self.nodes[i].id)
    }

    /// Machine instruction of a node, if it has one
    pub fn instr<'b>(&self, id: NodeId, block: &'b MachineBlock) -> Option<&'b MachineInstr> {
        self.node(id).instr.and_then(|i| block.instrs.get(i))
    }

    /// Add `dep` as a predecessor edge of `succ` (and the mirrored successor
    /// edge on `dep.node`).
    ///
    /// An existing edge with the same endpoints, kind and register is kept and
    /// its latency raised to the max of both; returns false in that case.
    pub fn add_dep(&mut self, succ: NodeId, dep: SchedDep) -> bool {
        let pred = dep.node;
        assert!(pred != succ, "self dependence on {}", succ);
        assert!(!pred.is_exit(), "the exit node cannot be a predecessor");

        if let Some(existing) = self.node(succ).preds.iter().position(|d| d.overlaps(&dep)) {
            let old = self.node(succ).preds[existing].latency;
            if old < dep.latency {
                self.node_mut(succ).preds[existing].latency = dep.latency;
                let mirror = self
                    .node_mut(pred)
                    .succs
                    .iter_mut()
                    .find(|d| d.overlaps(&dep.mirrored(succ)));
                if let Some(mirror) = mirror {
                    mirror.latency = dep.latency;
                }
            }
            return false;
        }

        self.node_mut(succ).preds.push(dep);
        self.node_mut(pred).succs.push(dep.mirrored(succ));
        true
    }

    /// Whether `pred` has a direct edge to `succ`
    pub fn is_pred(&self, pred: NodeId, succ: NodeId) -> bool {
        self.node(succ).is_pred(pred)
    }

    /// Direct edges from `pred` to `succ`
    pub fn edges_between(
        &self,
        pred: NodeId,
        succ: NodeId,
    ) -> impl Iterator<Item = &SchedDep> + '_ {
        self.node(succ).preds.iter().filter(move |d| d.node == pred)
    }

    /// Direct edge of a given kind from `pred` to `succ`
    pub fn edge(&self, pred: NodeId, succ: NodeId, kind: DepKind) -> Option<&SchedDep> {
        self.edges_between(pred, succ).find(|d| d.kind == kind)
    }

    /// All edges as `(pred, succ, dep)`, exit edges included
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, &SchedDep)> + '_ {
        self.nodes
            .iter()
            .chain(std::iter::once(&self.exit))
            .flat_map(|n| n.preds.iter().map(move |d| (d.node, n.id, d)))
    }

    pub fn num_edges(&self) -> usize {
        self.edges().count()
    }

    /// Edge counts keyed by kind
    pub fn edge_counts(&self) -> HashMap<DepKind, usize> {
        let mut counts = HashMap::new();
        for (_, _, dep) in self.edges() {
            *counts.entry(dep.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Whether a path leads from `from` to `to`
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = vec![false; self.nodes.len()];
        let mut worklist = vec![from];
        while let Some(id) = worklist.pop() {
            for dep in &self.node(id).succs {
                if dep.node == to {
                    return true;
                }
                if !dep.node.is_exit() && !seen[dep.node.index()] {
                    seen[dep.node.index()] = true;
                    worklist.push(dep.node);
                }
            }
        }
        false
    }

    /// Nodes in dependence order (Kahn's algorithm); the exit node comes last
    pub fn topological_order(&self) -> Result<Vec<NodeId>, SchedError> {
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.preds.len()).collect();
        let mut ready: VecDeque<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.preds.is_empty())
            .map(|n| n.id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len() + 1);

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dep in &self.node(id).succs {
                if dep.node.is_exit() {
                    continue;
                }
                let left = &mut remaining[dep.node.index()];
                *left -= 1;
                if *left == 0 {
                    ready.push_back(dep.node);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| remaining[n.id.index()] > 0)
                .map(|n| n.id)
                .unwrap_or(NodeId::EXIT);
            return Err(SchedError::Cycle(stuck));
        }
        order.push(NodeId::EXIT);
        Ok(order)
    }

    /// Check the structural invariants: every edge points at a node of this
    /// region, is mirrored on the other end, and the graph is acyclic
    pub fn verify(&self) -> Result<(), SchedError> {
        let exists = |id: NodeId| id.is_exit() || (id.0 as usize) < self.nodes.len();

        for node in self.nodes.iter().chain(std::iter::once(&self.exit)) {
            for dep in &node.preds {
                if !exists(dep.node) {
                    return Err(SchedError::DanglingEdge(dep.node));
                }
                if !self.node(dep.node).succs.iter().any(|s| s.overlaps(&dep.mirrored(node.id))) {
                    return Err(SchedError::AsymmetricEdge {
                        pred: dep.node,
                        succ: node.id,
                    });
                }
            }
            for dep in &node.succs {
                if !exists(dep.node) {
                    return Err(SchedError::DanglingEdge(dep.node));
                }
                if !self.node(dep.node).preds.iter().any(|p| p.overlaps(&dep.mirrored(node.id))) {
                    return Err(SchedError::AsymmetricEdge {
                        pred: node.id,
                        succ: dep.node,
                    });
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Final instruction order for a schedule, with debug values put back
    /// right after the instruction they followed originally.
    ///
    /// `sequence` must list every node exactly once, predecessors first.
    pub fn emit_order(&self, sequence: &[NodeId]) -> Result<Vec<InstrRef>, SchedError> {
        if sequence.len() != self.nodes.len() {
            return Err(SchedError::InvalidSchedule(format!(
                "{} nodes scheduled, region has {}",
                sequence.len(),
                self.nodes.len()
            )));
        }

        let mut placed = vec![false; self.nodes.len()];
        for &id in sequence {
            if id.is_exit() || id.index() >= self.nodes.len() {
                return Err(SchedError::InvalidSchedule(format!("{} is not a region node", id)));
            }
            if placed[id.index()] {
                return Err(SchedError::InvalidSchedule(format!("{} scheduled twice", id)));
            }
            if let Some(dep) = self.node(id).preds.iter().find(|d| !placed[d.node.index()]) {
                return Err(SchedError::InvalidSchedule(format!(
                    "{} scheduled before its predecessor {}",
                    id, dep.node
                )));
            }
            placed[id.index()] = true;
        }

        let mut anchored: HashMap<InstrRef, Vec<InstrRef>> = HashMap::new();
        for &(dbg, anchor) in &self.dbg_values {
            anchored.entry(anchor).or_default().push(dbg);
        }

        fn emit(
            instr: InstrRef,
            anchored: &HashMap<InstrRef, Vec<InstrRef>>,
            out: &mut Vec<InstrRef>,
        ) {
            out.push(instr);
            if let Some(dbgs) = anchored.get(&instr) {
                for &dbg in dbgs {
                    emit(dbg, anchored, out);
                }
            }
        }

        let mut out = Vec::with_capacity(self.end - self.begin);
        if let Some(first) = self.first_dbg_value {
            emit(first, &anchored, &mut out);
        }
        for &id in sequence {
            if let Some(instr) = self.node(id).instr {
                emit(instr, &anchored, &mut out);
            }
        }
        Ok(out)
    }

    pub fn dag_name(&self) -> String {
        format!("sched-{}[{}..{})", self.block, self.begin, self.end)
    }

    /// Label used when drawing the graph
    pub fn graph_node_label(&self, id: NodeId, block: &MachineBlock) -> String {
        match self.instr(id, block) {
            Some(mi) => format!("{}: {}", id, mi),
            None if id.is_exit() => "<exit>".to_string(),
            None => "<entry>".to_string(),
        }
    }

    /// Multi-line dump of every node with its instruction and edges
    pub fn dump(&self, block: &MachineBlock) -> String {
        let mut out = format!("{}:\n", self.dag_name());
        for node in self.nodes.iter().chain(std::iter::once(&self.exit)) {
            out.push_str(&self.graph_node_label(node.id, block));
            out.push('\n');
            self.dump_edges(node, &mut out);
        }
        out
    }

    fn dump_edges(&self, node: &SchedNode, out: &mut String) {
        out.push_str(&format!(
            "  # preds: {}  # succs: {}  latency: {}{}\n",
            node.preds.len(),
            node.succs.len(),
            node.latency,
            if node.is_schedule_high { "  schedule-high" } else { "" }
        ));
        for (title, deps) in [("Predecessors", &node.preds), ("Successors", &node.succs)] {
            if deps.is_empty() {
                continue;
            }
            out.push_str(&format!("  {}:\n", title));
            for dep in deps {
                out.push_str(&format!("    {}: {} latency={}", dep.node, dep.kind, dep.latency));
                if let Some(reg) = dep.reg {
                    out.push_str(&format!(" reg={}", reg));
                }
                out.push('\n');
            }
        }
    }
}

impl fmt::Display for ScheduleDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.dag_name())?;
        for node in self.nodes.iter().chain(std::iter::once(&self.exit)) {
            let mut edges = String::new();
            self.dump_edges(node, &mut edges);
            match node.instr {
                Some(i) => writeln!(f, "{} (instr {})", node.id, i)?,
                None => writeln!(f, "{}", node.id)?,
            }
            write!(f, "{}", edges)?;
        }
        Ok(())
    }
}
