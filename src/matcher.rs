//! Exact-shape classification of decoded instructions.
//!
//! Each rule compares the normalized opcode identity and the full operand
//! list; the rules are mutually exclusive, so the priority order below only
//! documents the original evaluation sequence. Three distinct `pop` shapes
//! collapse onto the same CFS kind but carry their own hook addresses, so the
//! matcher reports the concrete shape and callers look the hook up by shape.

use log::{debug, warn};

use crate::decoder::{DecodedInsn, Opcode, Reg};
use crate::CfsKind;

/// The concrete matched shape, one per configurable hook address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `b <imm>` (any condition)
    B,
    /// `bl <imm>` (any condition)
    Bl,
    /// `bx lr`
    BxLr,
    /// `pop {r3, r4, fp, pc}`
    PopR3R4FpPc,
    /// `pop {r4, fp, pc}`
    PopR4FpPc,
    /// `pop {fp, pc}`
    PopFpPc,
    /// `pop {fp, lr}`
    PopFpLr,
    /// `blx r3`
    BlxR3,
}

impl HookKind {
    /// The CFS kind this shape records as. The three `pop ... pc` shapes all
    /// collapse onto `PopFramePointerPc`.
    pub fn cfs_kind(&self) -> CfsKind {
        match self {
            HookKind::B => CfsKind::Branch,
            HookKind::Bl => CfsKind::BranchLink,
            HookKind::BxLr => CfsKind::BranchExchangeLr,
            HookKind::PopR3R4FpPc | HookKind::PopR4FpPc | HookKind::PopFpPc => {
                CfsKind::PopFramePointerPc
            }
            HookKind::PopFpLr => CfsKind::PopFramePointerLr,
            HookKind::BlxR3 => CfsKind::BranchLinkExchangeR3,
        }
    }
}

/// Classify one decoded instruction, or `None` for passthrough.
///
/// Classification is pure: it depends only on the opcode and operand list of
/// the instruction handed in. Unmatched `bx`/`blx` shapes are logged at warn
/// level to surface coverage gaps; everything else passes through silently at
/// debug level.
pub fn classify(insn: &DecodedInsn) -> Option<HookKind> {
    let kind = match (insn.opcode, insn.operands.as_slice()) {
        (Opcode::B, _) => Some(HookKind::B),
        (Opcode::Bl, _) => Some(HookKind::Bl),
        (Opcode::Bx, [Reg::Lr]) => Some(HookKind::BxLr),
        (Opcode::Pop, [Reg::R3, Reg::R4, Reg::Fp, Reg::Pc]) => Some(HookKind::PopR3R4FpPc),
        (Opcode::Pop, [Reg::R4, Reg::Fp, Reg::Pc]) => Some(HookKind::PopR4FpPc),
        (Opcode::Pop, [Reg::Fp, Reg::Pc]) => Some(HookKind::PopFpPc),
        (Opcode::Pop, [Reg::Fp, Reg::Lr]) => Some(HookKind::PopFpLr),
        (Opcode::Blx, [Reg::R3]) => Some(HookKind::BlxR3),
        _ => None,
    };

    if kind.is_none() {
        match insn.opcode {
            Opcode::Bx | Opcode::Blx => warn!(
                "unhandled shape at 0x{:08x}: {} {}",
                insn.addr, insn.mnemonic, insn.op_str
            ),
            _ => debug!(
                "passthrough at 0x{:08x}: {} {}",
                insn.addr, insn.mnemonic, insn.op_str
            ),
        }
    }
    kind
}
