//! Target capabilities consumed by the DAG builder
//!
//! The builder never hard-codes a machine: register overlap, latencies and
//! alias facts come through the traits here. Each trait has a small stock
//! implementation for table-driven targets and tests.

use std::collections::HashMap;

use crate::dag::SchedDep;
use crate::mir::{MachineInstr, Reg};

/// Register file description
pub trait RegisterInfo {
    /// Number of physical register numbers, `Reg::NONE` included
    fn num_regs(&self) -> usize;

    /// Whether `reg` names a physical register
    fn is_physical(&self, reg: Reg) -> bool {
        !reg.is_none() && !reg.is_virtual()
    }

    /// Every register sharing storage with `reg`, `reg` itself included
    fn overlaps(&self, reg: Reg) -> &[Reg];

    /// Printable name for dumps
    fn name(&self, reg: Reg) -> String {
        reg.to_string()
    }
}

/// Register file with explicit overlap groups (e.g. a 64-bit register and its
/// 32-bit half).
#[derive(Debug, Clone)]
pub struct RegisterFile {
    overlaps: Vec<Vec<Reg>>,
    names: HashMap<Reg, String>,
}

impl RegisterFile {
    /// `num_regs` registers, each overlapping only itself
    pub fn new(num_regs: usize) -> Self {
        let overlaps = (0..num_regs).map(|r| vec![Reg(r as u32)]).collect();
        Self {
            overlaps,
            names: HashMap::new(),
        }
    }

    /// Declare that `a` and `b` share storage
    pub fn with_overlap(mut self, a: Reg, b: Reg) -> Self {
        self.add_overlap(a, b);
        self
    }

    pub fn add_overlap(&mut self, a: Reg, b: Reg) {
        assert!(
            (a.0 as usize) < self.overlaps.len() && (b.0 as usize) < self.overlaps.len(),
            "overlap between {} and {} outside the register file",
            a,
            b
        );
        if a == b {
            return;
        }
        if !self.overlaps[a.0 as usize].contains(&b) {
            self.overlaps[a.0 as usize].push(b);
        }
        if !self.overlaps[b.0 as usize].contains(&a) {
            self.overlaps[b.0 as usize].push(a);
        }
    }

    pub fn with_name(mut self, reg: Reg, name: impl Into<String>) -> Self {
        self.names.insert(reg, name.into());
        self
    }
}

impl RegisterInfo for RegisterFile {
    fn num_regs(&self) -> usize {
        self.overlaps.len()
    }

    fn overlaps(&self, reg: Reg) -> &[Reg] {
        match self.overlaps.get(reg.0 as usize) {
            Some(regs) => regs,
            None => panic!("register {} outside the register file", reg),
        }
    }

    fn name(&self, reg: Reg) -> String {
        self.names.get(&reg).cloned().unwrap_or_else(|| reg.to_string())
    }
}

/// Instruction timing
pub trait TimingModel {
    /// Cycles before the result of `mi` is available
    fn instr_latency(&self, mi: &MachineInstr) -> u32;

    /// Cycles from operand `def_idx` of `def` being written to operand
    /// `use_idx` of `user` reading it, when the target knows better than the
    /// instruction latency
    fn operand_latency(
        &self,
        _def: &MachineInstr,
        _def_idx: usize,
        _user: &MachineInstr,
        _use_idx: usize,
    ) -> Option<u32> {
        None
    }

    /// Cycle at which operand `def_idx` of `def` becomes available, used when
    /// the reader is outside the region
    fn def_operand_cycle(&self, _def: &MachineInstr, _def_idx: usize) -> Option<u32> {
        None
    }

    /// Latency between two writes of the same register
    fn output_latency(&self, _def: &MachineInstr, _def_idx: usize, _later: &MachineInstr) -> u32 {
        1
    }

    /// Extra cycles when a value feeds the address of a load or store
    fn special_address_latency(&self) -> u32 {
        0
    }

    /// Last word on a data edge; `user` is `None` for the region exit
    fn adjust_dependency(
        &self,
        _def: &MachineInstr,
        _user: Option<&MachineInstr>,
        _dep: &mut SchedDep,
    ) {
    }
}

/// Every instruction takes one cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitTiming;

impl TimingModel for UnitTiming {
    fn instr_latency(&self, _mi: &MachineInstr) -> u32 {
        1
    }
}

/// Latencies looked up by opcode, with optional forwarding paths between
/// opcode pairs
#[derive(Debug, Clone)]
pub struct TableTiming {
    default_latency: u32,
    latencies: HashMap<String, u32>,
    forwarding: HashMap<(String, String), u32>,
    address_latency: u32,
}

impl Default for TableTiming {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TableTiming {
    pub fn new(default_latency: u32) -> Self {
        Self {
            default_latency,
            latencies: HashMap::new(),
            forwarding: HashMap::new(),
            address_latency: 0,
        }
    }

    pub fn with_latency(mut self, opcode: &str, latency: u32) -> Self {
        self.latencies.insert(opcode.to_string(), latency);
        self
    }

    /// Result of `def_opcode` reaches an operand of `use_opcode` in `latency`
    pub fn with_forwarding(mut self, def_opcode: &str, use_opcode: &str, latency: u32) -> Self {
        self.forwarding
            .insert((def_opcode.to_string(), use_opcode.to_string()), latency);
        self
    }

    pub fn with_address_latency(mut self, latency: u32) -> Self {
        self.address_latency = latency;
        self
    }
}

impl TimingModel for TableTiming {
    fn instr_latency(&self, mi: &MachineInstr) -> u32 {
        self.latencies
            .get(&mi.opcode)
            .copied()
            .unwrap_or(self.default_latency)
    }

    fn operand_latency(
        &self,
        def: &MachineInstr,
        _def_idx: usize,
        user: &MachineInstr,
        _use_idx: usize,
    ) -> Option<u32> {
        self.forwarding
            .get(&(def.opcode.clone(), user.opcode.clone()))
            .copied()
    }

    fn special_address_latency(&self) -> u32 {
        self.address_latency
    }
}

/// Answer of an alias query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// Alias analysis over the memory operands of two instructions
pub trait AliasOracle {
    fn alias(&self, a: &MachineInstr, b: &MachineInstr) -> AliasResult;
}

impl<F> AliasOracle for F
where
    F: Fn(&MachineInstr, &MachineInstr) -> AliasResult,
{
    fn alias(&self, a: &MachineInstr, b: &MachineInstr) -> AliasResult {
        self(a, b)
    }
}

/// Offset-range oracle: accesses to the same identified object with disjoint
/// byte ranges cannot alias, neither can accesses to distinct identified
/// objects. Anything involving an unknown object may alias.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetAliasOracle;

impl AliasOracle for OffsetAliasOracle {
    fn alias(&self, a: &MachineInstr, b: &MachineInstr) -> AliasResult {
        let mut result = AliasResult::NoAlias;
        for ma in a.mem_operands() {
            for mb in b.mem_operands() {
                match (ma.object, mb.object) {
                    (Some(oa), Some(ob)) if oa.id != ob.id => {}
                    (Some(_), Some(_)) => {
                        if ma.ranges_overlap(mb) {
                            if ma.offset == mb.offset && ma.size == mb.size {
                                if result == AliasResult::NoAlias {
                                    result = AliasResult::MustAlias;
                                }
                            } else {
                                return AliasResult::MayAlias;
                            }
                        }
                    }
                    _ => return AliasResult::MayAlias,
                }
            }
        }
        // No descriptions at all: nothing is known
        if a.mem_operands().next().is_none() || b.mem_operands().next().is_none() {
            return AliasResult::MayAlias;
        }
        result
    }
}
