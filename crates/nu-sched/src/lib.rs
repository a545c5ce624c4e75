//! Instruction scheduling DAG construction
//!
//! This crate builds the dependency graph a list scheduler works from, one
//! scheduling region at a time:
//! - [`mir`]: the machine instructions being scheduled
//! - [`cfg`]: CFG, dominators, liveness and loops of a machine function
//! - [`target`]: register overlap, timing and alias analysis capabilities
//! - [`builder`]: the backward walk that produces a [`ScheduleDag`]
//! - [`region`]: cutting blocks into regions and building a whole function
//!
//! ```
//! use nu_sched::{DagBuilder, RegisterFile, SchedOptions, SchedRegion, UnitTiming};
//! use nu_sched::mir::{MachineFunction, MachineInstr, Reg};
//!
//! let mut func = MachineFunction::new();
//! let bb = func.alloc_block();
//! let block = func.block_mut(bb);
//! block.push(MachineInstr::new("mov").with_def(Reg(1)).with_imm(7));
//! block.push(MachineInstr::new("add").with_def(Reg(2)).with_use(Reg(1)).with_imm(1));
//!
//! let regs = RegisterFile::new(8);
//! let mut builder = DagBuilder::new(&func, &regs, &UnitTiming, SchedOptions::default());
//! let dag = builder.build_region(SchedRegion::whole(func.block(bb)), None);
//!
//! assert_eq!(dag.len(), 2);
//! assert!(dag.verify().is_ok());
//! ```

pub mod builder;
pub mod cfg;
pub mod dag;
pub mod loop_deps;
pub mod mir;
pub mod options;
pub mod reg_map;
pub mod region;
pub mod target;

pub use builder::{DagBuilder, DagStats, LoopContext, STORE_LOAD_LATENCY};
pub use dag::{DepKind, NodeId, SchedDep, SchedNode, ScheduleDag};
pub use loop_deps::{LoopDep, LoopDependencies};
pub use options::SchedOptions;
pub use region::{SchedRegion, regions_in_block};
pub use target::{
    AliasOracle, AliasResult, OffsetAliasOracle, RegisterFile, RegisterInfo, TableTiming,
    TimingModel, UnitTiming,
};

use thiserror::Error;

/// Errors reported when checking a built DAG or a schedule against it
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("Dependency cycle through {0}")]
    Cycle(NodeId),

    #[error("Edge {pred} -> {succ} is missing on one of its ends")]
    AsymmetricEdge { pred: NodeId, succ: NodeId },

    #[error("Edge refers to unknown node {0}")]
    DanglingEdge(NodeId),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}
