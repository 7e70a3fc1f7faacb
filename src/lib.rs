//! Core types, traits, and the rewrite pipeline for the armpatch binary patcher.
//!
//! armpatch walks the code section of a flat, memory-mapped bare-metal ARM
//! (AArch32) image, recognizes a fixed catalogue of control-flow-transferring
//! instruction shapes, and replaces each one in place with a BL-shaped call to
//! a configured hook address. Every replacement is recorded as a control-flow
//! statement (CFS) so that branch and loop tables can be reconstructed after
//! the pass.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use armpatch::{
//!     decoder::CapstoneDecoder,
//!     engine::{HookTable, RewriteEngine, RewriteOptions},
//!     image::BinaryImage,
//!     analysis,
//!     Endianness,
//! };
//!
//! // Load the raw image and tell the engine where it maps in memory.
//! let mut image = BinaryImage::open("firmware.bin", 0x8000, Endianness::Little).unwrap();
//!
//! // Decode with Capstone in ARM mode.
//! let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();
//!
//! let options = RewriteOptions {
//!     text_start: 0x8000,
//!     text_end: 0x9000,
//!     hooks: HookTable::default(),
//!     omit: Vec::new(),
//!     dry_run: false,
//! };
//!
//! let records = RewriteEngine::new(options).run(&mut image, &decoder).unwrap();
//!
//! // Post-pass control-flow analysis over the recorded statements.
//! let branches = analysis::branch_table(&records);
//! let loops = analysis::loop_table(&records);
//! ```

pub mod analysis;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod format;
pub mod image;
pub mod matcher;

use std::fmt;

/// Represents an absolute address in the target's memory
pub type Address = u64;

/// Width of one ARM-mode instruction in bytes
pub const INSN_WIDTH: usize = 4;

/// Byte order of the target image (and therefore of every instruction word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little-endian (the common case for ARM firmware)
    #[default]
    Little,
    /// Big-endian (BE32 images)
    Big,
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "little"),
            Endianness::Big => write!(f, "big"),
        }
    }
}

/// The kind of a recognized control-flow statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfsKind {
    /// Direct branch (`b`), conditional or not
    Branch,
    /// Direct branch-and-link (`bl`)
    BranchLink,
    /// `bx lr` function return
    BranchExchangeLr,
    /// Frame-teardown `pop` ending in `pc` (any of the three matched shapes)
    PopFramePointerPc,
    /// Frame-teardown `pop` ending in `lr`
    PopFramePointerLr,
    /// Indirect call through `blx r3`
    BranchLinkExchangeR3,
}

impl fmt::Display for CfsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfsKind::Branch => write!(f, "b"),
            CfsKind::BranchLink => write!(f, "bl"),
            CfsKind::BranchExchangeLr => write!(f, "bx-lr"),
            CfsKind::PopFramePointerPc => write!(f, "pop-fp-pc"),
            CfsKind::PopFramePointerLr => write!(f, "pop-fp-lr"),
            CfsKind::BranchLinkExchangeR3 => write!(f, "blx-r3"),
        }
    }
}

/// One recorded control-flow statement.
///
/// Records are appended by the rewrite engine in encounter order, at most one
/// per instruction address, and never mutated afterwards. `source` and
/// `destination` are a matched pair: both meaningful (for `Branch` and
/// `BranchLink`, whose targets are statically known) or both zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfsRecord {
    /// Classified kind of the original instruction
    pub kind: CfsKind,
    /// Raw encoding of the instruction before rewriting, in image byte order
    pub original_bytes: [u8; 4],
    /// Absolute address of the instruction, or 0
    pub source: Address,
    /// Absolute branch target, or 0 when not statically determinable
    pub destination: Address,
}

impl CfsRecord {
    /// True if this record carries a statically known source/target pair.
    pub fn has_addresses(&self) -> bool {
        self.source != 0 || self.destination != 0
    }
}

/// Error type for rewrite operations
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// Absolute address falls outside the loaded image
    #[error("address 0x{0:08x} is outside the image bounds")]
    AddressOutOfRange(Address),

    /// Capstone error
    #[error("decoder error: {0}")]
    Decoder(#[from] capstone::Error),

    /// I/O error while reading or flushing the image
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
