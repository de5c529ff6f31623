//! x86-64 fault decoder backed by `iced-x86`.
//!
//! Only plain `MOV`/`MOVZX` forms between a general-purpose register (or an
//! immediate) and memory are emulated. Everything else that decodes is
//! reported as [`Operation::Unsupported`] and skipped by the caller.

use iced_x86::{Code, Decoder, DecoderOptions, OpKind, Register};

use super::decoder::{DecodedAccess, FaultDecoder, Operation, RegisterSlot, Undecodable};
use crate::protocol::AccessWidth;

/// Saved general-purpose registers of a Linux x86-64 `ucontext_t`.
pub type Registers = [libc::greg_t; 23];

#[derive(Clone, Copy)]
enum Shape {
    Load { mem: AccessWidth, dest: AccessWidth },
    Store(AccessWidth),
    StoreImmediate(AccessWidth),
}

fn shape(code: Code) -> Option<Shape> {
    use AccessWidth::*;
    use Code::*;
    let shape = match code {
        Mov_rm8_r8 | Mov_moffs8_AL => Shape::Store(Byte),
        Mov_rm16_r16 | Mov_moffs16_AX => Shape::Store(Word),
        Mov_rm32_r32 | Mov_moffs32_EAX => Shape::Store(Dword),
        Mov_rm64_r64 | Mov_moffs64_RAX => Shape::Store(Qword),

        Mov_r8_rm8 | Mov_AL_moffs8 => Shape::Load { mem: Byte, dest: Byte },
        Mov_r16_rm16 | Mov_AX_moffs16 => Shape::Load { mem: Word, dest: Word },
        Mov_r32_rm32 | Mov_EAX_moffs32 => Shape::Load { mem: Dword, dest: Dword },
        Mov_r64_rm64 | Mov_RAX_moffs64 => Shape::Load { mem: Qword, dest: Qword },

        Movzx_r16_rm8 => Shape::Load { mem: Byte, dest: Word },
        Movzx_r32_rm8 => Shape::Load { mem: Byte, dest: Dword },
        Movzx_r64_rm8 => Shape::Load { mem: Byte, dest: Qword },
        Movzx_r16_rm16 => Shape::Load { mem: Word, dest: Word },
        Movzx_r32_rm16 => Shape::Load { mem: Word, dest: Dword },
        Movzx_r64_rm16 => Shape::Load { mem: Word, dest: Qword },

        Mov_rm8_imm8 => Shape::StoreImmediate(Byte),
        Mov_rm16_imm16 => Shape::StoreImmediate(Word),
        Mov_rm32_imm32 => Shape::StoreImmediate(Dword),
        Mov_rm64_imm32 => Shape::StoreImmediate(Qword),
        _ => return None,
    };
    Some(shape)
}

/// Maps a general-purpose register (any width) to its `gregset_t` slot.
fn slot(reg: Register) -> Option<RegisterSlot> {
    use Register::*;
    let (index, shift) = match reg {
        AL | AX | EAX | RAX => (libc::REG_RAX, 0),
        CL | CX | ECX | RCX => (libc::REG_RCX, 0),
        DL | DX | EDX | RDX => (libc::REG_RDX, 0),
        BL | BX | EBX | RBX => (libc::REG_RBX, 0),
        AH => (libc::REG_RAX, 8),
        CH => (libc::REG_RCX, 8),
        DH => (libc::REG_RDX, 8),
        BH => (libc::REG_RBX, 8),
        SPL | SP | ESP | RSP => (libc::REG_RSP, 0),
        BPL | BP | EBP | RBP => (libc::REG_RBP, 0),
        SIL | SI | ESI | RSI => (libc::REG_RSI, 0),
        DIL | DI | EDI | RDI => (libc::REG_RDI, 0),
        R8L | R8W | R8D | R8 => (libc::REG_R8, 0),
        R9L | R9W | R9D | R9 => (libc::REG_R9, 0),
        R10L | R10W | R10D | R10 => (libc::REG_R10, 0),
        R11L | R11W | R11D | R11 => (libc::REG_R11, 0),
        R12L | R12W | R12D | R12 => (libc::REG_R12, 0),
        R13L | R13W | R13D | R13 => (libc::REG_R13, 0),
        R14L | R14W | R14D | R14 => (libc::REG_R14, 0),
        R15L | R15W | R15D | R15 => (libc::REG_R15, 0),
        // `Register::None` shadows the prelude here.
        _ => return Option::None,
    };
    Some(RegisterSlot {
        index: index as usize,
        shift,
    })
}

/// Decoder for 64-bit x86 code running on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Decoder;

impl FaultDecoder for X86Decoder {
    type Registers = Registers;

    fn pc(&self, regs: &Registers) -> usize {
        regs[libc::REG_RIP as usize] as usize
    }

    fn classify(&self, pc: usize, code: &[u8]) -> Result<DecodedAccess, Undecodable> {
        let mut decoder = Decoder::with_ip(64, code, pc as u64, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Undecodable {
                pc,
                first_byte: code.first().copied().unwrap_or(0),
            });
        }

        let len = instr.len();
        let unsupported = DecodedAccess {
            op: Operation::Unsupported,
            width: AccessWidth::Dword,
            len,
        };
        let Some(shape) = shape(instr.code()) else {
            return Ok(unsupported);
        };

        let decoded = match shape {
            Shape::Load { mem, dest } if instr.op1_kind() == OpKind::Memory => {
                slot(instr.op0_register()).map(|slot| DecodedAccess {
                    op: Operation::Load {
                        dest: slot,
                        dest_width: dest,
                    },
                    width: mem,
                    len,
                })
            }
            Shape::Store(width) if instr.op0_kind() == OpKind::Memory => {
                slot(instr.op1_register()).map(|src| DecodedAccess {
                    op: Operation::StoreRegister { src },
                    width,
                    len,
                })
            }
            Shape::StoreImmediate(width) if instr.op0_kind() == OpKind::Memory => {
                Some(DecodedAccess {
                    // Sign-extended for `Mov_rm64_imm32`, masked to the width later.
                    op: Operation::StoreImmediate {
                        value: instr.immediate(1),
                    },
                    width,
                    len,
                })
            }
            _ => None,
        };
        Ok(decoded.unwrap_or(unsupported))
    }

    fn read_register(&self, regs: &Registers, slot: RegisterSlot) -> u64 {
        (regs[slot.index] as u64) >> slot.shift
    }

    fn complete_load(&self, regs: &mut Registers, access: &DecodedAccess, value: u64) {
        let Operation::Load { dest, dest_width } = access.op else {
            return;
        };
        let value = value & access.width.mask();
        let old = regs[dest.index] as u64;
        let new = match dest_width {
            // 32-bit destinations clear the upper half.
            AccessWidth::Dword | AccessWidth::Qword => value & dest_width.mask(),
            AccessWidth::Byte | AccessWidth::Word => {
                let mask = dest_width.mask() << dest.shift;
                (old & !mask) | ((value << dest.shift) & mask)
            }
        };
        regs[dest.index] = new as i64;
    }

    fn advance_pc(&self, regs: &mut Registers, len: usize) {
        let rip = &mut regs[libc::REG_RIP as usize];
        *rip = (*rip as usize).wrapping_add(len) as i64;
    }
}
