//! Capstone-based ARM-mode instruction decoder.
//!
//! The engine never looks at Capstone types directly: each decoded
//! instruction is normalized into an opcode identity plus an ordered register
//! operand list, which is all the pattern matcher needs for its exact-shape
//! comparisons.

use capstone::arch::arm::{ArmInsn, ArmOperandType};
use capstone::prelude::*;
use capstone::{Arch, Capstone, Endian, Mode, NO_EXTRA_MODE};

use crate::{Address, Endianness, RewriteError, INSN_WIDTH};

/// Normalized opcode identity of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Direct branch, conditional or not
    B,
    /// Branch and link
    Bl,
    /// Branch and exchange
    Bx,
    /// Branch with link and exchange
    Blx,
    /// Pop registers from the stack
    Pop,
    /// Anything the matcher has no rule for
    Other,
}

/// Normalized ARM core register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    Fp,
    Ip,
    Sp,
    Lr,
    Pc,
    /// A register (or non-register operand) the matcher never compares against
    Other,
}

impl Reg {
    /// Map a Capstone register name, accepting the usual AAPCS aliases.
    fn from_name(name: &str) -> Reg {
        match name {
            "r0" => Reg::R0,
            "r1" => Reg::R1,
            "r2" => Reg::R2,
            "r3" => Reg::R3,
            "r4" => Reg::R4,
            "r5" => Reg::R5,
            "r6" => Reg::R6,
            "r7" => Reg::R7,
            "r8" => Reg::R8,
            "r9" | "sb" => Reg::R9,
            "r10" | "sl" => Reg::R10,
            "r11" | "fp" => Reg::Fp,
            "r12" | "ip" => Reg::Ip,
            "r13" | "sp" => Reg::Sp,
            "r14" | "lr" => Reg::Lr,
            "r15" | "pc" => Reg::Pc,
            _ => Reg::Other,
        }
    }
}

/// One decoded ARM-mode instruction in normalized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInsn {
    /// Absolute address of the instruction
    pub addr: Address,
    /// Raw encoding in image byte order (always 4 bytes in ARM mode)
    pub bytes: [u8; 4],
    /// The encoding as a 32-bit word, endianness resolved
    pub word: u32,
    /// Normalized opcode identity
    pub opcode: Opcode,
    /// Ordered register operand list
    pub operands: Vec<Reg>,
    /// Mnemonic as printed by the decoder (diagnostics only)
    pub mnemonic: String,
    /// Operand string as printed by the decoder (diagnostics only)
    pub op_str: String,
}

/// Decoder trait: yields a batch of consecutive instructions from a window.
pub trait Decoder {
    /// Decode up to `max` instructions starting at absolute address `at`,
    /// reading from `window` (whose first byte maps to `at`). Decoding stops
    /// early at undecodable bytes; the returned batch may be empty.
    fn decode_batch(
        &self,
        window: &[u8],
        at: Address,
        max: usize,
    ) -> Result<Vec<DecodedInsn>, RewriteError>;
}

/// A Capstone decoder fixed to ARM mode (AArch32, 4-byte instructions).
pub struct CapstoneDecoder {
    cs: Capstone,
    endian: Endianness,
}

impl CapstoneDecoder {
    /// Build an ARM-mode decoder for the given image byte order.
    pub fn new(endian: Endianness) -> Result<Self, RewriteError> {
        let cs_endian = match endian {
            Endianness::Little => Endian::Little,
            Endianness::Big => Endian::Big,
        };
        let mut cs = Capstone::new_raw(Arch::ARM, Mode::Arm, NO_EXTRA_MODE, Some(cs_endian))?;
        cs.set_detail(true)?;
        Ok(Self { cs, endian })
    }

    fn opcode_of(id: u32) -> Opcode {
        match id {
            x if x == ArmInsn::ARM_INS_B as u32 => Opcode::B,
            x if x == ArmInsn::ARM_INS_BL as u32 => Opcode::Bl,
            x if x == ArmInsn::ARM_INS_BX as u32 => Opcode::Bx,
            x if x == ArmInsn::ARM_INS_BLX as u32 => Opcode::Blx,
            x if x == ArmInsn::ARM_INS_POP as u32 => Opcode::Pop,
            _ => Opcode::Other,
        }
    }
}

impl Decoder for CapstoneDecoder {
    fn decode_batch(
        &self,
        window: &[u8],
        at: Address,
        max: usize,
    ) -> Result<Vec<DecodedInsn>, RewriteError> {
        let insns = self.cs.disasm_count(window, at, max)?;

        let mut batch = Vec::with_capacity(insns.len());
        for insn in insns.iter() {
            let raw = insn.bytes();
            if raw.len() != INSN_WIDTH {
                // Not reachable in ARM mode, but never emit a partial word.
                break;
            }
            let bytes: [u8; 4] = raw.try_into().expect("length checked above");
            let word = match self.endian {
                Endianness::Little => u32::from_le_bytes(bytes),
                Endianness::Big => u32::from_be_bytes(bytes),
            };

            let mut operands = Vec::new();
            let detail = self.cs.insn_detail(insn)?;
            if let ArchDetail::ArmDetail(arm) = detail.arch_detail() {
                for op in arm.operands() {
                    match op.op_type {
                        ArmOperandType::Reg(reg_id) => {
                            let name = self.cs.reg_name(reg_id).unwrap_or_default();
                            operands.push(Reg::from_name(&name));
                        }
                        _ => operands.push(Reg::Other),
                    }
                }
            }

            batch.push(DecodedInsn {
                addr: insn.address(),
                bytes,
                word,
                opcode: Self::opcode_of(insn.id().0),
                operands,
                mnemonic: insn.mnemonic().unwrap_or("").to_string(),
                op_str: insn.op_str().unwrap_or("").to_string(),
            });
        }
        Ok(batch)
    }
}
