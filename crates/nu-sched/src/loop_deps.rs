//! Loop-carried register dependencies
//!
//! For a loop, records where each register live into the header is last read
//! inside the loop body. The DAG builder uses this to shorten the latency of a
//! def that only feeds the next iteration: if the reader sits `count`
//! instructions into its block, that many cycles of the def's latency are
//! already covered by the time the reader issues.
//!
//! ## Algorithm
//!
//! Depth-first walk of the dominator tree starting at the loop header, pruned
//! to blocks inside the loop. Each block is scanned in program order; debug
//! values are skipped and do not advance the position counter.

use std::collections::{HashMap, HashSet};

use crate::cfg::{DominatorTree, Loop};
use crate::mir::{BlockId, InstrRef, MachineFunction, Reg};

/// Last in-loop read of a header live-in register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDep {
    pub block: BlockId,
    pub instr: InstrRef,
    /// Operand index of the read
    pub operand: usize,
    /// Zero-based position of the reading instruction among the real
    /// instructions of its block
    pub count: u32,
}

#[derive(Debug, Default)]
pub struct LoopDependencies {
    deps: HashMap<Reg, LoopDep>,
}

impl LoopDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze `lp`, which must contain its own header
    pub fn visit_loop(&mut self, func: &MachineFunction, domtree: &DominatorTree, lp: &Loop) {
        assert!(self.deps.is_empty(), "stale loop dependencies");
        assert!(lp.contains(lp.header), "loop does not contain its header {}", lp.header);
        assert!(
            domtree.contains(lp.header),
            "loop header {} is not in the dominator tree",
            lp.header
        );

        let live_ins: HashSet<Reg> = func.block(lp.header).live_ins.iter().copied().collect();
        if live_ins.is_empty() {
            return;
        }

        let mut stack = vec![lp.header];
        while let Some(block_id) = stack.pop() {
            self.visit_block(func, block_id, &live_ins);
            for &child in domtree.children(block_id).iter().rev() {
                if lp.contains(child) {
                    stack.push(child);
                }
            }
        }

        log::trace!(
            "loop at {}: {} loop-carried register(s)",
            lp.header,
            self.deps.len()
        );
    }

    fn visit_block(
        &mut self,
        func: &MachineFunction,
        block_id: BlockId,
        live_ins: &HashSet<Reg>,
    ) {
        let block = func.block(block_id);
        let mut count = 0u32;
        for (idx, mi) in block.instrs.iter().enumerate() {
            if mi.is_debug_value() {
                continue;
            }
            for (op_idx, op) in mi.reg_operands() {
                if op.reads_reg() && live_ins.contains(&op.reg) {
                    self.deps.insert(
                        op.reg,
                        LoopDep {
                            block: block_id,
                            instr: idx,
                            operand: op_idx,
                            count,
                        },
                    );
                }
            }
            count += 1;
        }
    }

    pub fn get(&self, reg: Reg) -> Option<&LoopDep> {
        self.deps.get(&reg)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn clear(&mut self) {
        self.deps.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Reg, &LoopDep)> + '_ {
        self.deps.iter().map(|(&r, d)| (r, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CFG, LoopInfo};
    use crate::mir::{MachineInstr, MemOperand};

    /// bb0 -> bb1 (header) -> bb2 -> bb1, bb2 -> bb3
    fn make_loop() -> MachineFunction {
        let mut func = MachineFunction::new();
        for _ in 0..4 {
            func.alloc_block();
        }
        func.add_successor(BlockId(0), BlockId(1));
        func.add_successor(BlockId(1), BlockId(2));
        func.add_successor(BlockId(2), BlockId(1));
        func.add_successor(BlockId(2), BlockId(3));

        let header = func.block_mut(BlockId(1));
        header.live_ins = vec![Reg(1), Reg(2)];
        header.push(MachineInstr::new("add").with_def(Reg(3)).with_use(Reg(1)).with_imm(1));
        header.push(MachineInstr::debug_value(Reg(2)));
        header.push(
            MachineInstr::new("ld")
                .with_def(Reg(4))
                .with_address(Reg(2))
                .load(MemOperand::unknown(4)),
        );

        let latch = func.block_mut(BlockId(2));
        latch.push(MachineInstr::new("nop"));
        latch.push(MachineInstr::new("add").with_def(Reg(1)).with_use(Reg(1)).with_imm(4));
        latch.push(MachineInstr::new("br").terminator());
        func
    }

    fn analyze(func: &MachineFunction) -> LoopDependencies {
        let cfg = CFG::build(func);
        let tree = DominatorTree::compute(func, &cfg);
        let loops = LoopInfo::compute(func, &cfg);
        let lp = loops.loop_for(BlockId(1)).unwrap();
        let mut deps = LoopDependencies::new();
        deps.visit_loop(func, &tree, lp);
        deps
    }

    #[test]
    fn test_last_use_wins() {
        let func = make_loop();
        let deps = analyze(&func);

        assert_eq!(deps.len(), 2);
        // r1 is read in the header and again in the latch, the latch comes later
        let r1 = deps.get(Reg(1)).unwrap();
        assert_eq!(r1.block, BlockId(2));
        assert_eq!(r1.instr, 1);
        assert_eq!(r1.count, 1);
    }

    #[test]
    fn test_debug_values_not_counted() {
        let func = make_loop();
        let deps = analyze(&func);

        let r2 = deps.get(Reg(2)).unwrap();
        assert_eq!(r2.block, BlockId(1));
        assert_eq!(r2.instr, 2);
        assert_eq!(r2.operand, 1);
        // DBG_VALUE before the load is skipped
        assert_eq!(r2.count, 1);
    }

    #[test]
    fn test_clear_allows_reuse() {
        let func = make_loop();
        let mut deps = analyze(&func);
        deps.clear();
        assert!(deps.is_empty());

        let cfg = CFG::build(&func);
        let tree = DominatorTree::compute(&func, &cfg);
        let loops = LoopInfo::compute(&func, &cfg);
        deps.visit_loop(&func, &tree, loops.loop_for(BlockId(2)).unwrap());
        assert_eq!(deps.len(), 2);
    }

    #[test]
    #[should_panic(expected = "stale loop dependencies")]
    fn test_visit_requires_empty_table() {
        let func = make_loop();
        let mut deps = analyze(&func);
        let cfg = CFG::build(&func);
        let tree = DominatorTree::compute(&func, &cfg);
        let loops = LoopInfo::compute(&func, &cfg);
        deps.visit_loop(&func, &tree, loops.loop_for(BlockId(1)).unwrap());
    }

    #[test]
    #[should_panic(expected = "does not contain its header")]
    fn test_header_outside_loop_is_fatal() {
        let func = make_loop();
        let cfg = CFG::build(&func);
        let tree = DominatorTree::compute(&func, &cfg);
        let lp = Loop {
            header: BlockId(1),
            blocks: [BlockId(2)].into_iter().collect(),
        };
        LoopDependencies::new().visit_loop(&func, &tree, &lp);
    }
}
