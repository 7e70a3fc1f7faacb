//! Bit-level decode/encode of ARM branch-class instruction words.
//!
//! ARM-mode B/BL encodings carry a 24-bit two's-complement word offset in the
//! low bits (sign bit is bit 23), relative to the instruction's own address
//! plus 8 (the PC points two instructions ahead). Decode and encode below use
//! that same base, so `branch_target(encode_bl(w, a, t), a) == t` for any
//! word-aligned target within the signed 24-bit range (roughly +/-32 MiB).

/// Condition field, bits 31..28.
pub const COND_MASK: u32 = 0xf000_0000;

/// BL opcode pattern, bits 27..24 = 0b1011.
pub const BL_OPCODE: u32 = 0x0b00_0000;

/// Signed 24-bit word offset field, bits 23..0.
pub const OFFSET_MASK: u32 = 0x00ff_ffff;

const OFFSET_SIGN_BIT: u32 = 0x0080_0000;

/// Absolute target of a B/BL instruction word located at `addr`.
pub fn branch_target(word: u32, addr: u32) -> u32 {
    let mut offset = word & OFFSET_MASK;
    if offset & OFFSET_SIGN_BIT != 0 {
        offset |= !OFFSET_MASK; // sign-extend from bit 23
    }
    addr.wrapping_add(8).wrapping_add(offset.wrapping_mul(4))
}

/// Build the BL-shaped replacement word for the instruction `original` at
/// `addr`, redirected to `target`.
///
/// The condition field is copied verbatim from `original`, so a conditional
/// branch becomes a conditional call under the same condition. The caller
/// must place hooks so the word offset fits in 24 signed bits; no overflow
/// check is performed here.
pub fn encode_bl(original: u32, addr: u32, target: u32) -> u32 {
    let offset = target.wrapping_sub(addr.wrapping_add(8)) as i32 / 4;
    (original & COND_MASK) | BL_OPCODE | (offset as u32 & OFFSET_MASK)
}
