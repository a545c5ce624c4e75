//! Machine-level Intermediate Representation (MIR) consumed by the scheduler
//!
//! MIR here is the target-level form that comes out of instruction selection:
//! - Registers are numbered; physical and virtual registers share one space
//! - Operands carry def/use/kill/dead flags, as the register allocator sees them
//! - Memory instructions describe what they touch through memory operands
//! - Blocks keep an explicit successor list and their live-in physical registers
//!
//! Nothing in this module knows about scheduling; it is the read-only input of
//! the DAG builder.

use std::fmt;

/// Register number. `Reg::NONE` (0) means "no register" and is ignored.
///
/// Virtual registers are encoded with the top bit set, the same convention the
/// stock [`RegisterInfo`](crate::target::RegisterInfo) implementations use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl Reg {
    pub const NONE: Reg = Reg(0);

    const VIRTUAL_BIT: u32 = 1 << 31;

    /// Create the virtual register with the given index
    pub fn virt(index: u32) -> Self {
        assert!(index < Self::VIRTUAL_BIT, "virtual register index overflow");
        Reg(index | Self::VIRTUAL_BIT)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_virtual(self) -> bool {
        self.0 & Self::VIRTUAL_BIT != 0
    }

    /// Dense index of a virtual register (for sparse maps)
    pub fn virt_index(self) -> usize {
        assert!(self.is_virtual(), "{self} is not a virtual register");
        (self.0 & !Self::VIRTUAL_BIT) as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "noreg")
        } else if self.is_virtual() {
            write!(f, "%{}", self.virt_index())
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Position of an instruction inside its block
pub type InstrRef = usize;

/// A register operand with its allocator-visible flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOperand {
    pub reg: Reg,
    /// Operand writes the register (otherwise it reads it)
    pub is_def: bool,
    /// Last read of the register's value
    pub is_kill: bool,
    /// Written value is never read
    pub is_dead: bool,
    /// Read of an undefined value; does not actually read the register
    pub is_undef: bool,
    /// Pointer operand of a memory access
    pub is_address: bool,
    /// Not part of the instruction encoding (e.g. flags, call clobbers)
    pub is_implicit: bool,
}

impl RegOperand {
    /// Whether this operand reads the register's current value
    pub fn reads_reg(&self) -> bool {
        !self.is_def && !self.is_undef
    }
}

/// Identified underlying memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemObject {
    pub id: u32,
    /// False when the object can only be reached through this identity
    /// (fixed spill slots, constant pools), so unknown accesses never touch it
    pub may_alias: bool,
}

/// Description of the memory touched by a load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub object: Option<MemObject>,
    pub offset: i64,
    pub size: u32,
    pub is_volatile: bool,
    pub is_invariant: bool,
}

impl MemOperand {
    /// Access to memory nothing is known about
    pub fn unknown(size: u32) -> Self {
        Self {
            object: None,
            offset: 0,
            size,
            is_volatile: false,
            is_invariant: false,
        }
    }

    /// Access to an identified object that may be reached through other pointers
    pub fn object(id: u32, offset: i64, size: u32) -> Self {
        Self {
            object: Some(MemObject { id, may_alias: true }),
            offset,
            size,
            is_volatile: false,
            is_invariant: false,
        }
    }

    /// Access to an object no other pointer can reach (e.g. a spill slot)
    pub fn private(id: u32, offset: i64, size: u32) -> Self {
        Self {
            object: Some(MemObject {
                id,
                may_alias: false,
            }),
            offset,
            size,
            is_volatile: false,
            is_invariant: false,
        }
    }

    pub fn volatile(mut self) -> Self {
        self.is_volatile = true;
        self
    }

    pub fn invariant(mut self) -> Self {
        self.is_invariant = true;
        self
    }

    /// Whether the byte ranges of two accesses to the same object intersect
    pub fn ranges_overlap(&self, other: &MemOperand) -> bool {
        let (a_lo, a_hi) = (self.offset, self.offset + self.size as i64);
        let (b_lo, b_hi) = (other.offset, other.offset + other.size as i64);
        a_lo < b_hi && b_lo < a_hi
    }
}

/// Machine operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Physical or virtual register
    Reg(RegOperand),
    /// Immediate
    Imm(i64),
    /// Memory reference
    Mem(MemOperand),
    /// Anything the scheduler does not look at (block refs, symbols, ...)
    Other,
}

impl Operand {
    fn reg(reg: Reg, is_def: bool) -> Self {
        Operand::Reg(RegOperand {
            reg,
            is_def,
            is_kill: false,
            is_dead: false,
            is_undef: false,
            is_address: false,
            is_implicit: false,
        })
    }

    pub fn as_reg(&self) -> Option<&RegOperand> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Instruction properties the scheduler cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrFlags {
    pub may_load: bool,
    pub may_store: bool,
    pub is_call: bool,
    pub is_terminator: bool,
    pub is_label: bool,
    pub is_debug_value: bool,
    pub has_unmodeled_side_effects: bool,
    /// Target-specific region boundary (e.g. stack pointer adjustment)
    pub is_sched_boundary: bool,
}

/// A machine instruction
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInstr {
    pub opcode: String,
    pub operands: Vec<Operand>,
    pub flags: InstrFlags,
}

impl MachineInstr {
    pub fn new(opcode: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            operands: Vec::new(),
            flags: InstrFlags::default(),
        }
    }

    /// `DBG_VALUE` pseudo instruction describing `reg`
    pub fn debug_value(reg: Reg) -> Self {
        let mut mi = Self::new("DBG_VALUE").with_use(reg);
        mi.flags.is_debug_value = true;
        mi
    }

    // Builder-style constructors, used by instruction selection and tests

    pub fn with_def(mut self, reg: Reg) -> Self {
        self.operands.push(Operand::reg(reg, true));
        self
    }

    pub fn with_dead_def(self, reg: Reg) -> Self {
        self.with_def_flags(reg, |op| op.is_dead = true)
    }

    pub fn with_implicit_def(self, reg: Reg) -> Self {
        self.with_def_flags(reg, |op| op.is_implicit = true)
    }

    pub fn with_use(mut self, reg: Reg) -> Self {
        self.operands.push(Operand::reg(reg, false));
        self
    }

    pub fn with_kill(self, reg: Reg) -> Self {
        self.with_use_flags(reg, |op| op.is_kill = true)
    }

    pub fn with_undef_use(self, reg: Reg) -> Self {
        self.with_use_flags(reg, |op| op.is_undef = true)
    }

    pub fn with_address(self, reg: Reg) -> Self {
        self.with_use_flags(reg, |op| op.is_address = true)
    }

    pub fn with_implicit_use(self, reg: Reg) -> Self {
        self.with_use_flags(reg, |op| op.is_implicit = true)
    }

    pub fn with_imm(mut self, imm: i64) -> Self {
        self.operands.push(Operand::Imm(imm));
        self
    }

    pub fn with_other(mut self) -> Self {
        self.operands.push(Operand::Other);
        self
    }

    /// Load through `mem`
    pub fn load(mut self, mem: MemOperand) -> Self {
        self.flags.may_load = true;
        self.operands.push(Operand::Mem(mem));
        self
    }

    /// Store through `mem`
    pub fn store(mut self, mem: MemOperand) -> Self {
        self.flags.may_store = true;
        self.operands.push(Operand::Mem(mem));
        self
    }

    pub fn call(mut self) -> Self {
        self.flags.is_call = true;
        self
    }

    pub fn terminator(mut self) -> Self {
        self.flags.is_terminator = true;
        self
    }

    pub fn label(mut self) -> Self {
        self.flags.is_label = true;
        self
    }

    pub fn side_effects(mut self) -> Self {
        self.flags.has_unmodeled_side_effects = true;
        self
    }

    pub fn sched_boundary(mut self) -> Self {
        self.flags.is_sched_boundary = true;
        self
    }

    fn with_def_flags(mut self, reg: Reg, f: impl FnOnce(&mut RegOperand)) -> Self {
        let mut op = RegOperand {
            reg,
            is_def: true,
            is_kill: false,
            is_dead: false,
            is_undef: false,
            is_address: false,
            is_implicit: false,
        };
        f(&mut op);
        self.operands.push(Operand::Reg(op));
        self
    }

    fn with_use_flags(mut self, reg: Reg, f: impl FnOnce(&mut RegOperand)) -> Self {
        let mut op = RegOperand {
            reg,
            is_def: false,
            is_kill: false,
            is_dead: false,
            is_undef: false,
            is_address: false,
            is_implicit: false,
        };
        f(&mut op);
        self.operands.push(Operand::Reg(op));
        self
    }

    /// Register operands with their operand index, skipping `Reg::NONE`
    pub fn reg_operands(&self) -> impl Iterator<Item = (usize, &RegOperand)> + '_ {
        self.operands
            .iter()
            .enumerate()
            .filter_map(|(idx, op)| op.as_reg().map(|r| (idx, r)))
            .filter(|(_, r)| !r.reg.is_none())
    }

    /// Registers written by this instruction
    pub fn defs(&self) -> Vec<Reg> {
        self.reg_operands()
            .filter(|(_, r)| r.is_def)
            .map(|(_, r)| r.reg)
            .collect()
    }

    /// Registers read by this instruction
    pub fn uses(&self) -> Vec<Reg> {
        self.reg_operands()
            .filter(|(_, r)| r.reads_reg())
            .map(|(_, r)| r.reg)
            .collect()
    }

    /// Memory operands in operand order
    pub fn mem_operands(&self) -> impl Iterator<Item = &MemOperand> + '_ {
        self.operands.iter().filter_map(|op| match op {
            Operand::Mem(m) => Some(m),
            _ => None,
        })
    }

    /// Index of the first operand defining exactly `reg`
    pub fn find_def_operand(&self, reg: Reg) -> Option<usize> {
        self.reg_operands()
            .find(|(_, r)| r.is_def && r.reg == reg)
            .map(|(idx, _)| idx)
    }

    /// Index of the first operand reading exactly `reg`
    pub fn find_use_operand(&self, reg: Reg) -> Option<usize> {
        self.reg_operands()
            .find(|(_, r)| r.reads_reg() && r.reg == reg)
            .map(|(idx, _)| idx)
    }

    /// Whether every def of `reg` in this instruction is dead
    pub fn register_def_is_dead(&self, reg: Reg) -> bool {
        let mut defs = self.reg_operands().filter(|(_, r)| r.is_def && r.reg == reg);
        defs.all(|(_, r)| r.is_dead)
    }

    pub fn reg_operand(&self, idx: usize) -> &RegOperand {
        match &self.operands[idx] {
            Operand::Reg(r) => r,
            other => panic!("operand {idx} of {} is not a register: {other:?}", self.opcode),
        }
    }

    pub fn may_load(&self) -> bool {
        self.flags.may_load
    }

    pub fn may_store(&self) -> bool {
        self.flags.may_store
    }

    pub fn is_call(&self) -> bool {
        self.flags.is_call
    }

    pub fn is_debug_value(&self) -> bool {
        self.flags.is_debug_value
    }

    pub fn is_terminator(&self) -> bool {
        self.flags.is_terminator
    }

    pub fn is_label(&self) -> bool {
        self.flags.is_label
    }

    /// Calls and instructions with side effects the target does not describe.
    /// Nothing may be reordered across these.
    pub fn is_barrier(&self) -> bool {
        self.flags.is_call || self.flags.has_unmodeled_side_effects
    }

    /// Memory access whose order must be kept: volatile, or with no memory
    /// operand telling us what it touches
    pub fn has_ordered_memory_ref(&self) -> bool {
        if !self.may_load() && !self.may_store() {
            return false;
        }
        let mut mems = self.mem_operands().peekable();
        if mems.peek().is_none() {
            return true;
        }
        mems.any(|m| m.is_volatile)
    }

    /// Load from memory that never changes
    pub fn is_invariant_load(&self) -> bool {
        if !self.may_load() || self.may_store() {
            return false;
        }
        let mut mems = self.mem_operands().peekable();
        mems.peek().is_some() && mems.all(|m| m.is_invariant)
    }

    /// Several memory operands, one of them naming an object no other pointer
    /// reaches. The memory chains track such objects only one at a time.
    pub fn spans_private_objects(&self) -> bool {
        if self.is_invariant_load() {
            return false;
        }
        let mut mems = self.mem_operands();
        let Some(first) = mems.next() else {
            return false;
        };
        let private = |m: &MemOperand| m.object.is_some_and(|obj| !obj.may_alias);
        let mut rest = mems.peekable();
        rest.peek().is_some() && (private(first) || rest.any(private))
    }

    /// Everything must be ordered against this instruction's memory effects
    pub fn is_global_memory_object(&self) -> bool {
        self.is_barrier() || self.has_ordered_memory_ref() || self.spans_private_objects()
    }

    /// Identified object accessed by an instruction with a single memory operand
    pub fn underlying_object(&self) -> Option<MemObject> {
        let mut mems = self.mem_operands();
        let first = mems.next()?;
        if mems.next().is_some() {
            return None;
        }
        first.object
    }

    /// Ends a scheduling region: nothing is scheduled across it
    pub fn is_sched_boundary(&self) -> bool {
        self.flags.is_terminator || self.flags.is_label || self.flags.is_sched_boundary
    }
}

impl fmt::Display for MachineInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let defs: Vec<String> = self
            .reg_operands()
            .filter(|(_, r)| r.is_def)
            .map(|(_, r)| {
                if r.is_dead {
                    format!("{}<dead>", r.reg)
                } else {
                    r.reg.to_string()
                }
            })
            .collect();
        if !defs.is_empty() {
            write!(f, "{} = ", defs.join(", "))?;
        }
        write!(f, "{}", self.opcode)?;

        let mut first = true;
        for op in &self.operands {
            let text = match op {
                Operand::Reg(r) if r.is_def => continue,
                Operand::Reg(r) if r.is_kill => format!("{}<kill>", r.reg),
                Operand::Reg(r) if r.is_undef => format!("{}<undef>", r.reg),
                Operand::Reg(r) => r.reg.to_string(),
                Operand::Imm(imm) => imm.to_string(),
                Operand::Mem(m) => match m.object {
                    Some(obj) => format!("[obj{}+{}]", obj.id, m.offset),
                    None => "[?]".to_string(),
                },
                Operand::Other => "<other>".to_string(),
            };
            write!(f, "{}{}", if first { " " } else { ", " }, text)?;
            first = false;
        }
        Ok(())
    }
}

/// A basic block of machine instructions
#[derive(Debug, Clone)]
pub struct MachineBlock {
    pub id: BlockId,
    /// All instructions, terminators included
    pub instrs: Vec<MachineInstr>,
    pub successors: Vec<BlockId>,
    /// Physical registers live on entry
    pub live_ins: Vec<Reg>,
}

impl MachineBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instrs: Vec::new(),
            successors: Vec::new(),
            live_ins: Vec::new(),
        }
    }

    pub fn push(&mut self, mi: MachineInstr) -> InstrRef {
        self.instrs.push(mi);
        self.instrs.len() - 1
    }

    pub fn is_live_in(&self, reg: Reg) -> bool {
        self.live_ins.contains(&reg)
    }
}

/// A complete machine function
#[derive(Debug, Clone)]
pub struct MachineFunction {
    pub name: Option<String>,
    /// Basic blocks (entry block is first)
    pub blocks: Vec<MachineBlock>,
    pub entry: BlockId,
    /// Number of virtual registers created so far
    pub num_virt_regs: u32,
}

impl MachineFunction {
    pub fn new() -> Self {
        Self {
            name: None,
            blocks: Vec::new(),
            entry: BlockId(0),
            num_virt_regs: 0,
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn alloc_vreg(&mut self) -> Reg {
        let reg = Reg::virt(self.num_virt_regs);
        self.num_virt_regs += 1;
        reg
    }

    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(MachineBlock::new(id));
        id
    }

    /// Add a CFG edge
    pub fn add_successor(&mut self, from: BlockId, to: BlockId) {
        let block = self.block_mut(from);
        if !block.successors.contains(&to) {
            block.successors.push(to);
        }
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut MachineBlock {
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("Block {:?} not found", id))
    }

    pub fn block(&self, id: BlockId) -> &MachineBlock {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("Block {:?} not found", id))
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks.iter().any(|b| b.id == id)
    }
}

impl Default for MachineFunction {
    fn default() -> Self {
        Self::new()
    }
}
