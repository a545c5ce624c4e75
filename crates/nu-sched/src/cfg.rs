//! Control Flow Graph construction and analysis over machine code
//!
//! This module builds a CFG from a `MachineFunction` and provides the analyses
//! the scheduler consults:
//! - Predecessor/successor relationships
//! - Dominators and the dominator tree
//! - Physical register liveness (block live-in sets)
//! - Natural loop detection

use std::collections::{HashMap, HashSet, VecDeque};

use crate::mir::{BlockId, MachineFunction, Reg};

/// Control Flow Graph built from a machine function
#[derive(Debug)]
pub struct CFG {
    /// Entry block
    pub entry: BlockId,
    /// Predecessors for each block
    pub predecessors: HashMap<BlockId, Vec<BlockId>>,
    /// Successors for each block
    pub successors: HashMap<BlockId, Vec<BlockId>>,
    /// Immediate dominator for each block (entry has none)
    pub idom: HashMap<BlockId, BlockId>,
    /// Reverse post-order traversal (for dataflow analysis)
    pub rpo: Vec<BlockId>,
    /// Post-order traversal
    pub post_order: Vec<BlockId>,
}

impl CFG {
    /// Build a CFG from a machine function
    pub fn build(func: &MachineFunction) -> Self {
        let mut cfg = CFG {
            entry: func.entry,
            predecessors: HashMap::new(),
            successors: HashMap::new(),
            idom: HashMap::new(),
            rpo: Vec::new(),
            post_order: Vec::new(),
        };

        for block in &func.blocks {
            cfg.predecessors.insert(block.id, Vec::new());
            cfg.successors.insert(block.id, Vec::new());
        }

        for block in &func.blocks {
            let succs: Vec<BlockId> = block
                .successors
                .iter()
                .copied()
                .filter(|&s| func.has_block(s))
                .collect();
            for &succ in &succs {
                cfg.predecessors.entry(succ).or_default().push(block.id);
            }
            cfg.successors.insert(block.id, succs);
        }

        if func.blocks.is_empty() {
            return cfg;
        }

        cfg.compute_post_order(func);
        cfg.compute_dominators(func);

        cfg
    }

    /// Compute post-order traversal using an explicit DFS stack
    fn compute_post_order(&mut self, func: &MachineFunction) {
        let mut visited = HashSet::new();
        let mut post_order = Vec::new();
        // (block, index of the next successor to visit)
        let mut stack = vec![(func.entry, 0usize)];
        visited.insert(func.entry);

        while let Some((block, next)) = stack.pop() {
            let succs = &self.successors[&block];
            if let Some(&succ) = succs.get(next) {
                stack.push((block, next + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                post_order.push(block);
            }
        }

        self.rpo = post_order.iter().rev().copied().collect();
        self.post_order = post_order;
    }

    /// Compute immediate dominators using the Cooper-Harvey-Kennedy algorithm
    fn compute_dominators(&mut self, func: &MachineFunction) {
        let rpo_index: HashMap<BlockId, usize> =
            self.rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut doms: HashMap<BlockId, Option<BlockId>> = HashMap::new();
        for block in &func.blocks {
            doms.insert(block.id, None);
        }
        doms.insert(func.entry, Some(func.entry));

        let mut changed = true;
        while changed {
            changed = false;

            for &block_id in &self.rpo {
                if block_id == func.entry {
                    continue;
                }

                let preds = &self.predecessors[&block_id];
                let Some(mut idom) = preds
                    .iter()
                    .copied()
                    .find(|p| doms.get(p).and_then(|d| *d).is_some())
                else {
                    continue;
                };

                for &pred in preds {
                    if pred != idom && doms.get(&pred).and_then(|d| *d).is_some() {
                        idom = Self::intersect(pred, idom, &doms, &rpo_index);
                    }
                }

                if doms.get(&block_id).and_then(|d| *d) != Some(idom) {
                    doms.insert(block_id, Some(idom));
                    changed = true;
                }
            }
        }

        for (block_id, dom) in doms {
            if let Some(idom) = dom
                && block_id != idom
            {
                self.idom.insert(block_id, idom);
            }
        }
    }

    /// Walk both fingers up the dominator tree until they meet
    fn intersect(
        b1: BlockId,
        b2: BlockId,
        doms: &HashMap<BlockId, Option<BlockId>>,
        rpo_index: &HashMap<BlockId, usize>,
    ) -> BlockId {
        let get_idx = |b: BlockId| rpo_index.get(&b).copied().unwrap_or(usize::MAX);

        let mut finger1 = b1;
        let mut finger2 = b2;

        while finger1 != finger2 {
            while get_idx(finger1) > get_idx(finger2) {
                match doms.get(&finger1).and_then(|d| *d) {
                    Some(dom) if dom != finger1 => finger1 = dom,
                    _ => return finger2,
                }
            }
            while get_idx(finger2) > get_idx(finger1) {
                match doms.get(&finger2).and_then(|d| *d) {
                    Some(dom) if dom != finger2 => finger2 = dom,
                    _ => return finger1,
                }
            }
        }
        finger1
    }

    /// Check if block A dominates block B
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(&idom) = self.idom.get(&current) {
            if idom == a {
                return true;
            }
            if idom == current {
                break;
            }
            current = idom;
        }
        false
    }

    /// Get all blocks reachable from entry
    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        self.rpo.iter().copied().collect()
    }
}

/// Dominator tree with ordered children, for depth-first walks
#[derive(Debug)]
pub struct DominatorTree {
    pub root: BlockId,
    /// Children of each reachable block, in function block order
    pub children: HashMap<BlockId, Vec<BlockId>>,
    idom: HashMap<BlockId, BlockId>,
}

impl DominatorTree {
    pub fn compute(func: &MachineFunction, cfg: &CFG) -> Self {
        let reachable = cfg.reachable_blocks();
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for block in &func.blocks {
            if reachable.contains(&block.id) {
                children.entry(block.id).or_default();
            }
        }
        for block in &func.blocks {
            if let Some(&idom) = cfg.idom.get(&block.id) {
                children.entry(idom).or_default().push(block.id);
            }
        }
        Self {
            root: cfg.entry,
            children,
            idom: cfg.idom.clone(),
        }
    }

    /// Whether `block` is a node of the tree (reachable from entry)
    pub fn contains(&self, block: BlockId) -> bool {
        self.children.contains_key(&block)
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom.get(&current) {
                Some(&up) if up != current => current = up,
                _ => return false,
            }
        }
    }
}

/// Physical register liveness results
#[derive(Debug)]
pub struct LivenessInfo {
    /// Physical registers live at the start of each block
    pub live_in: HashMap<BlockId, HashSet<Reg>>,
    /// Physical registers live at the end of each block
    pub live_out: HashMap<BlockId, HashSet<Reg>>,
}

impl LivenessInfo {
    /// Compute physical register liveness for a machine function
    pub fn compute(func: &MachineFunction, cfg: &CFG) -> Self {
        let mut info = LivenessInfo {
            live_in: HashMap::new(),
            live_out: HashMap::new(),
        };

        for block in &func.blocks {
            info.live_in.insert(block.id, HashSet::new());
            info.live_out.insert(block.id, HashSet::new());
        }

        // live_in[B] = use[B] ∪ (live_out[B] - def[B])
        // live_out[B] = ∪ live_in[S] for all successors S of B
        let mut changed = true;
        while changed {
            changed = false;

            for &block_id in cfg.post_order.iter() {
                let block = func.block(block_id);

                let mut live_out: HashSet<Reg> = HashSet::new();
                for succ_id in &cfg.successors[&block_id] {
                    if let Some(succ_live_in) = info.live_in.get(succ_id) {
                        live_out.extend(succ_live_in);
                    }
                }

                let mut live_in = live_out.clone();
                for mi in block.instrs.iter().rev() {
                    if mi.is_debug_value() {
                        continue;
                    }
                    for (_, op) in mi.reg_operands() {
                        if op.is_def && !op.reg.is_virtual() {
                            live_in.remove(&op.reg);
                        }
                    }
                    for (_, op) in mi.reg_operands() {
                        if op.reads_reg() && !op.reg.is_virtual() {
                            live_in.insert(op.reg);
                        }
                    }
                }

                if live_in != info.live_in[&block_id] || live_out != info.live_out[&block_id] {
                    changed = true;
                    info.live_in.insert(block_id, live_in);
                    info.live_out.insert(block_id, live_out);
                }
            }
        }

        info
    }

    /// Store the computed live-in sets on the blocks, sorted by register
    pub fn apply_live_ins(&self, func: &mut MachineFunction) {
        for block in &mut func.blocks {
            if let Some(live) = self.live_in.get(&block.id) {
                let mut regs: Vec<Reg> = live.iter().copied().collect();
                regs.sort();
                block.live_ins = regs;
            }
        }
    }
}

/// A natural loop
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    pub blocks: HashSet<BlockId>,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// Loop information
#[derive(Debug)]
pub struct LoopInfo {
    /// Natural loops keyed by header; back edges sharing a header are merged
    pub loops: HashMap<BlockId, Loop>,
    /// Loop depth for each block (0 = not in a loop)
    pub loop_depth: HashMap<BlockId, usize>,
}

impl LoopInfo {
    /// Detect natural loops in the CFG
    pub fn compute(func: &MachineFunction, cfg: &CFG) -> Self {
        let mut info = LoopInfo {
            loops: HashMap::new(),
            loop_depth: HashMap::new(),
        };

        for block in &func.blocks {
            info.loop_depth.insert(block.id, 0);
        }

        // Back edge: B -> H where H dominates B
        let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
        for block in &func.blocks {
            for &succ in &cfg.successors[&block.id] {
                if cfg.dominates(succ, block.id) {
                    back_edges.push((block.id, succ));
                }
            }
        }

        for (tail, header) in back_edges {
            let mut loop_blocks = HashSet::new();
            loop_blocks.insert(header);

            // Everything that reaches the tail without passing the header
            let mut worklist = VecDeque::new();
            if tail != header {
                loop_blocks.insert(tail);
                worklist.push_back(tail);
            }

            while let Some(block) = worklist.pop_front() {
                for &pred in &cfg.predecessors[&block] {
                    if loop_blocks.insert(pred) {
                        worklist.push_back(pred);
                    }
                }
            }

            info.loops
                .entry(header)
                .or_insert_with(|| Loop {
                    header,
                    blocks: HashSet::new(),
                })
                .blocks
                .extend(loop_blocks);
        }

        for lp in info.loops.values() {
            for &block in &lp.blocks {
                *info.loop_depth.entry(block).or_insert(0) += 1;
            }
        }

        info
    }

    /// Check if a block is a loop header
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.contains_key(&block)
    }

    /// Get the loop depth of a block
    pub fn depth(&self, block: BlockId) -> usize {
        self.loop_depth.get(&block).copied().unwrap_or(0)
    }

    /// Innermost loop containing `block`
    pub fn loop_for(&self, block: BlockId) -> Option<&Loop> {
        self.loops
            .values()
            .filter(|lp| lp.contains(block))
            .min_by_key(|lp| (lp.blocks.len(), lp.header))
    }
}
