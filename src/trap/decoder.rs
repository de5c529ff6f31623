//! ISA-neutral view of a faulting memory access.

use core::fmt;

use crate::protocol::AccessWidth;

/// Longest instruction the decoders need to look at.
pub const MAX_INSN_LEN: usize = 15;

/// A general-purpose register slot in the saved context.
///
/// `shift` is the bit offset of the sub-register (8 for x86 `AH`-style
/// registers, 0 otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSlot {
    pub index: usize,
    pub shift: u8,
}

/// What the faulting instruction does with memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Load into `dest`; `dest_width` is the destination register width,
    /// which may exceed the memory width for zero-extending loads.
    Load {
        dest: RegisterSlot,
        dest_width: AccessWidth,
    },
    /// Store of a register.
    StoreRegister { src: RegisterSlot },
    /// Store of a constant encoded in the instruction.
    StoreImmediate { value: u64 },
    /// Decodable, but not an access this engine emulates.
    Unsupported,
}

/// Result of classifying the instruction at the faulting PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAccess {
    pub op: Operation,
    /// Memory access width.
    pub width: AccessWidth,
    /// Instruction length in bytes.
    pub len: usize,
}

impl DecodedAccess {
    pub fn is_store(&self) -> bool {
        matches!(
            self.op,
            Operation::StoreRegister { .. } | Operation::StoreImmediate { .. }
        )
    }
}

/// Instruction bytes that do not form a valid instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Undecodable {
    pub pc: usize,
    pub first_byte: u8,
}

impl fmt::Display for Undecodable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undecodable instruction {:#04x} at {:#x}", self.first_byte, self.pc)
    }
}

/// Classifies faulting instructions and edits the saved register context.
///
/// Implementations must be async-signal-safe: they run inside the fault
/// handler and may neither allocate nor lock.
pub trait FaultDecoder: Send + Sync {
    /// Saved register context of the faulting thread.
    type Registers;

    /// Program counter stored in `regs`.
    fn pc(&self, regs: &Self::Registers) -> usize;

    /// Classifies the instruction whose bytes start at `code[0]`, located at
    /// `pc`.
    fn classify(&self, pc: usize, code: &[u8]) -> Result<DecodedAccess, Undecodable>;

    /// Value stored by a store instruction, truncated to the access width.
    fn store_value(&self, regs: &Self::Registers, access: &DecodedAccess) -> u64 {
        let raw = match access.op {
            Operation::StoreRegister { src } => self.read_register(regs, src),
            Operation::StoreImmediate { value } => value,
            _ => 0,
        };
        raw & access.width.mask()
    }

    /// Reads a register slot, already shifted down.
    fn read_register(&self, regs: &Self::Registers, slot: RegisterSlot) -> u64;

    /// Writes `value` into the destination of a load, with the ISA's merge
    /// rules for partial registers.
    fn complete_load(&self, regs: &mut Self::Registers, access: &DecodedAccess, value: u64);

    /// Moves the program counter forward by `len` bytes.
    fn advance_pc(&self, regs: &mut Self::Registers, len: usize);
}
