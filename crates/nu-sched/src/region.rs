//! Scheduling regions
//!
//! A block is cut at every instruction nothing may be scheduled across:
//! terminators, labels and target-specific boundaries. Each piece between two
//! cuts is a region; the cut that ends a region is its exit instruction and
//! stays in place.

use std::fmt;

use crate::builder::DagBuilder;
use crate::dag::ScheduleDag;
use crate::mir::{BlockId, InstrRef, MachineBlock, MachineInstr};
use crate::target::AliasOracle;

/// Instructions `begin..end` of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedRegion {
    pub block: BlockId,
    pub begin: InstrRef,
    /// One past the last instruction; the exit instruction when in range
    pub end: InstrRef,
}

impl SchedRegion {
    pub fn new(block: BlockId, begin: InstrRef, end: InstrRef) -> Self {
        Self { block, begin, end }
    }

    /// The whole block, for blocks without boundaries
    pub fn whole(block: &MachineBlock) -> Self {
        Self::new(block.id, 0, block.instrs.len())
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Instruction right after the region, if it is in the block
    pub fn exit_instr<'b>(&self, block: &'b MachineBlock) -> Option<&'b MachineInstr> {
        block.instrs.get(self.end)
    }
}

impl fmt::Display for SchedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.block, self.begin, self.end)
    }
}

/// Split `block` into regions, in program order. Empty regions are skipped.
pub fn regions_in_block(block: &MachineBlock) -> Vec<SchedRegion> {
    let mut regions = Vec::new();
    let mut end = block.instrs.len();

    // Bottom-up, so each region knows its exit instruction
    for idx in (0..block.instrs.len()).rev() {
        if block.instrs[idx].is_sched_boundary() {
            if idx + 1 < end {
                regions.push(SchedRegion::new(block.id, idx + 1, end));
            }
            end = idx;
        }
    }
    if end > 0 {
        regions.push(SchedRegion::new(block.id, 0, end));
    }

    regions.reverse();
    regions
}

impl DagBuilder<'_> {
    /// Build every region of every block of the function, handing each DAG to
    /// `f` as soon as it is built
    pub fn build_function(
        &mut self,
        aa: Option<&dyn AliasOracle>,
        mut f: impl FnMut(&SchedRegion, ScheduleDag),
    ) {
        let func = self.func();
        for block in &func.blocks {
            for region in regions_in_block(block) {
                let dag = self.build_region(region, aa);
                f(&region, dag);
            }
        }
        log::debug!(
            "scheduled {}: {} region(s), {} node(s), {} edge(s)",
            func.name.as_deref().unwrap_or("<anon>"),
            self.stats().regions,
            self.stats().nodes,
            self.stats().edges()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{MachineInstr, Reg};

    fn block_with(instrs: Vec<MachineInstr>) -> MachineBlock {
        let mut block = MachineBlock::new(BlockId(0));
        for mi in instrs {
            block.push(mi);
        }
        block
    }

    #[test]
    fn test_split_at_terminator_and_boundary() {
        let block = block_with(vec![
            MachineInstr::new("mov").with_def(Reg(1)).with_imm(0),
            MachineInstr::new("add").with_def(Reg(1)).with_use(Reg(1)),
            MachineInstr::new("adjstack").sched_boundary(),
            MachineInstr::new("mov").with_def(Reg(2)).with_imm(1),
            MachineInstr::new("ret").with_use(Reg(2)).terminator(),
        ]);

        let regions = regions_in_block(&block);
        assert_eq!(
            regions,
            vec![
                SchedRegion::new(BlockId(0), 0, 2),
                SchedRegion::new(BlockId(0), 3, 4),
            ]
        );
        assert_eq!(regions[0].exit_instr(&block).unwrap().opcode, "adjstack");
        assert_eq!(regions[1].exit_instr(&block).unwrap().opcode, "ret");
    }

    #[test]
    fn test_fallthrough_block_is_one_region() {
        let block = block_with(vec![
            MachineInstr::new("nop"),
            MachineInstr::new("nop"),
        ]);
        let regions = regions_in_block(&block);
        assert_eq!(regions, vec![SchedRegion::whole(&block)]);
        assert!(regions[0].exit_instr(&block).is_none());
    }

    #[test]
    fn test_adjacent_boundaries_give_no_empty_regions() {
        let block = block_with(vec![
            MachineInstr::new("lbl").label(),
            MachineInstr::new("b1").sched_boundary(),
            MachineInstr::new("jmp").terminator(),
        ]);
        assert!(regions_in_block(&block).is_empty());
        assert!(regions_in_block(&MachineBlock::new(BlockId(3))).is_empty());
    }
}
