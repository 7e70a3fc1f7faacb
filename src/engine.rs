//! The rewrite walk: decode, classify, encode, patch, record.
//!
//! The walk is single-threaded and strictly in program order. Instructions
//! are pulled from the decoder in bounded batches; after each batch the
//! cursor re-seeks to the last decoded address, so adjacent batches overlap
//! by one instruction. That boundary instruction is yielded by both batches
//! and must be discarded the second time: the engine tracks the last address
//! it accepted across batch boundaries. If a batch decodes nothing, the
//! cursor still advances by one instruction width so the walk cannot stall.

use std::collections::HashSet;

use log::{debug, info};

use crate::codec;
use crate::decoder::{DecodedInsn, Decoder};
use crate::image::BinaryImage;
use crate::matcher::{self, HookKind};
use crate::{Address, CfsKind, CfsRecord, RewriteError, INSN_WIDTH};

/// Instructions requested per decode batch.
const DEFAULT_BATCH: usize = 64;

/// The eight configured hook target addresses, one per matched shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookTable {
    /// Hook for `b <imm>`
    pub b: Address,
    /// Hook for `bl <imm>`
    pub bl: Address,
    /// Hook for `bx lr`
    pub bx_lr: Address,
    /// Hook for `pop {r3, r4, fp, pc}`
    pub pop_r3_r4_fp_pc: Address,
    /// Hook for `pop {r4, fp, pc}`
    pub pop_r4_fp_pc: Address,
    /// Hook for `pop {fp, pc}`
    pub pop_fp_pc: Address,
    /// Hook for `pop {fp, lr}`
    pub pop_fp_lr: Address,
    /// Hook for `blx r3`
    pub blx_r3: Address,
}

impl HookTable {
    /// Hook target for a matched shape.
    pub fn target(&self, kind: HookKind) -> Address {
        match kind {
            HookKind::B => self.b,
            HookKind::Bl => self.bl,
            HookKind::BxLr => self.bx_lr,
            HookKind::PopR3R4FpPc => self.pop_r3_r4_fp_pc,
            HookKind::PopR4FpPc => self.pop_r4_fp_pc,
            HookKind::PopFpPc => self.pop_fp_pc,
            HookKind::PopFpLr => self.pop_fp_lr,
            HookKind::BlxR3 => self.blx_r3,
        }
    }
}

/// Everything one rewrite run needs besides the image and the decoder.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// First address of the code range to scan
    pub text_start: Address,
    /// One past the last address of the code range
    pub text_end: Address,
    /// Hook targets per matched shape
    pub hooks: HookTable,
    /// Instruction addresses to skip even when they would match
    pub omit: Vec<Address>,
    /// Compute and record everything, but never touch the image bytes
    pub dry_run: bool,
}

/// Orchestrates one rewrite pass and owns the growing CFS record list.
pub struct RewriteEngine {
    options: RewriteOptions,
    omit: HashSet<Address>,
    batch_size: usize,
    records: Vec<CfsRecord>,
}

impl RewriteEngine {
    /// Create an engine for one run.
    pub fn new(options: RewriteOptions) -> Self {
        let omit = options.omit.iter().copied().collect();
        Self {
            options,
            omit,
            batch_size: DEFAULT_BATCH,
            records: Vec::new(),
        }
    }

    /// Override the decode batch size (mainly useful to exercise batch
    /// boundaries; the default is fine for real runs).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Walk `[text_start, text_end)`, patching the image in place (unless
    /// dry-run) and returning the CFS records in encounter order.
    pub fn run<D: Decoder>(
        mut self,
        image: &mut BinaryImage,
        decoder: &D,
    ) -> Result<Vec<CfsRecord>, RewriteError> {
        let image_end = image.end_address();
        let mut cursor = self.options.text_start;
        let mut last_accepted: Option<Address> = None;

        'walk: while cursor < self.options.text_end && cursor < image_end {
            let batch = decoder.decode_batch(image.window(cursor)?, cursor, self.batch_size)?;

            let mut batch_last: Option<Address> = None;
            for insn in &batch {
                if last_accepted == Some(insn.addr) {
                    // Boundary instruction seen again after a re-seek.
                    continue;
                }
                last_accepted = Some(insn.addr);
                batch_last = Some(insn.addr);

                if self.omit.contains(&insn.addr) {
                    debug!("omit list: skipping 0x{:08x}", insn.addr);
                    if insn.addr >= self.options.text_end {
                        break 'walk;
                    }
                    continue;
                }

                if let Some(kind) = matcher::classify(insn) {
                    self.rewrite(image, insn, kind)?;
                }

                if insn.addr >= self.options.text_end {
                    break;
                }
            }

            cursor = match batch_last {
                Some(addr) if addr > cursor => addr,
                // Decoder stalled (or yielded nothing new): force progress.
                _ => cursor + INSN_WIDTH as Address,
            };
        }

        info!(
            "rewrite pass complete: {} control-flow statements{}",
            self.records.len(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );
        Ok(self.records)
    }

    fn rewrite(
        &mut self,
        image: &mut BinaryImage,
        insn: &DecodedInsn,
        kind: HookKind,
    ) -> Result<(), RewriteError> {
        let hook = self.options.hooks.target(kind);
        let replacement = codec::encode_bl(insn.word, insn.addr as u32, hook as u32);

        let cfs_kind = kind.cfs_kind();
        let (source, destination) = match cfs_kind {
            CfsKind::Branch | CfsKind::BranchLink => (
                insn.addr,
                codec::branch_target(insn.word, insn.addr as u32) as Address,
            ),
            _ => (0, 0),
        };

        debug!(
            "{} {} at 0x{:08x} -> bl 0x{:08x}",
            insn.mnemonic, insn.op_str, insn.addr, hook
        );

        self.records.push(CfsRecord {
            kind: cfs_kind,
            original_bytes: insn.bytes,
            source,
            destination,
        });

        if !self.options.dry_run {
            image.write_word(insn.addr, replacement)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CapstoneDecoder;
    use crate::Endianness;

    fn hooks() -> HookTable {
        HookTable {
            b: 0x9000,
            bl: 0x9040,
            bx_lr: 0x9080,
            pop_r3_r4_fp_pc: 0x90c0,
            pop_r4_fp_pc: 0x9100,
            pop_fp_pc: 0x9140,
            pop_fp_lr: 0x9180,
            blx_r3: 0x91c0,
        }
    }

    fn options(text_start: Address, text_end: Address) -> RewriteOptions {
        RewriteOptions {
            text_start,
            text_end,
            hooks: hooks(),
            omit: Vec::new(),
            dry_run: false,
        }
    }

    fn image_of(words: &[u32], load_address: Address) -> BinaryImage {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        BinaryImage::from_bytes(bytes, load_address, Endianness::Little)
    }

    #[test]
    fn test_end_to_end_two_instructions() {
        // b #0x20 ; pop {fp, pc}
        let mut image = image_of(&[0xea000006, 0xe8bd8800], 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();
        let mut opts = options(0x0, 0x8);
        opts.hooks.pop_fp_pc = 0x9100;

        let records = RewriteEngine::new(opts).run(&mut image, &decoder).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, CfsKind::Branch);
        assert_eq!(records[0].source, 0x0);
        assert_eq!(records[0].destination, 0x20);
        assert_eq!(records[1].kind, CfsKind::PopFramePointerPc);
        assert_eq!(records[1].source, 0);
        assert_eq!(records[1].destination, 0);

        // Both words are BL-shaped and target their hooks.
        let w0 = image.read_word(0x0).unwrap();
        assert_eq!(w0, 0xeb0023fe);
        let w1 = image.read_word(0x4).unwrap();
        assert_eq!(w1 & codec::COND_MASK, 0xe000_0000);
        assert_eq!(codec::branch_target(w1, 0x4), 0x9100);

        let branches = crate::analysis::branch_table(&records);
        assert_eq!(branches.len(), 1);
    }

    #[test]
    fn test_all_shapes_are_rewritten() {
        let words = [
            0xea000006, // b
            0xeb000010, // bl
            0xe12fff1e, // bx lr
            0xe8bd8818, // pop {r3, r4, fp, pc}
            0xe8bd8810, // pop {r4, fp, pc}
            0xe8bd8800, // pop {fp, pc}
            0xe8bd4800, // pop {fp, lr}
            0xe12fff33, // blx r3
            0xe1a00000, // mov r0, r0 (passthrough)
        ];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();
        let hooks = hooks();

        let records = RewriteEngine::new(options(0x0, words.len() as Address * 4))
            .run(&mut image, &decoder)
            .unwrap();

        assert_eq!(records.len(), 8);
        let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CfsKind::Branch,
                CfsKind::BranchLink,
                CfsKind::BranchExchangeLr,
                CfsKind::PopFramePointerPc,
                CfsKind::PopFramePointerPc,
                CfsKind::PopFramePointerPc,
                CfsKind::PopFramePointerLr,
                CfsKind::BranchLinkExchangeR3,
            ]
        );

        // Each pop shape targets its own hook.
        for (addr, hook) in [
            (0x0c, hooks.pop_r3_r4_fp_pc),
            (0x10, hooks.pop_r4_fp_pc),
            (0x14, hooks.pop_fp_pc),
            (0x18, hooks.pop_fp_lr),
        ] {
            let w = image.read_word(addr).unwrap();
            assert_eq!(codec::branch_target(w, addr as u32), hook as u32);
        }

        // The mov passes through untouched.
        assert_eq!(image.read_word(0x20).unwrap(), 0xe1a00000);
    }

    #[test]
    fn test_conditional_branch_keeps_condition() {
        // bne #0x20
        let mut image = image_of(&[0x1a000006], 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let records = RewriteEngine::new(options(0x0, 0x4))
            .run(&mut image, &decoder)
            .unwrap();

        assert_eq!(records.len(), 1);
        let w = image.read_word(0x0).unwrap();
        assert_eq!(w & codec::COND_MASK, 0x1000_0000);
        assert_eq!(codec::branch_target(w, 0x0), 0x9000);
    }

    #[test]
    fn test_dry_run_leaves_image_untouched() {
        let words = [0xea000006, 0xe8bd8800, 0xe12fff1e];
        let mut wet = image_of(&words, 0x0);
        let mut dry = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let wet_records = RewriteEngine::new(options(0x0, 0xc))
            .run(&mut wet, &decoder)
            .unwrap();

        let mut opts = options(0x0, 0xc);
        opts.dry_run = true;
        let before = dry.as_slice().to_vec();
        let dry_records = RewriteEngine::new(opts).run(&mut dry, &decoder).unwrap();

        assert_eq!(wet_records, dry_records);
        assert_eq!(dry.as_slice(), &before[..]);
        assert_ne!(wet.as_slice(), &before[..]);
    }

    #[test]
    fn test_omit_list_honored() {
        let words = [0xea000006, 0xea000005];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let mut opts = options(0x0, 0x8);
        opts.omit = vec![0x0];
        let records = RewriteEngine::new(opts).run(&mut image, &decoder).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, 0x4);
        assert_eq!(image.read_word(0x0).unwrap(), 0xea000006);
        assert_ne!(image.read_word(0x4).unwrap(), 0xea000005);
    }

    #[test]
    fn test_omitted_instruction_at_text_end_terminates_walk() {
        // Four branches; the omitted one sits exactly at text_end, which ends
        // the whole walk: nothing past it is touched, not even instructions
        // the current batch already decoded.
        let words = [0xea000006u32; 4];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let mut opts = options(0x0, 0x8);
        opts.omit = vec![0x8];
        let records = RewriteEngine::new(opts).run(&mut image, &decoder).unwrap();

        let sources: Vec<_> = records.iter().map(|r| r.source).collect();
        assert_eq!(sources, vec![0x0, 0x4]);
        assert_eq!(image.read_word(0x8).unwrap(), 0xea000006);
        assert_eq!(image.read_word(0xc).unwrap(), 0xea000006);
    }

    #[test]
    fn test_instruction_at_text_end_is_still_processed() {
        // The batch stops after the instruction that reaches text_end, but
        // that boundary instruction itself is still rewritten.
        let words = [0xea000006u32; 4];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let records = RewriteEngine::new(options(0x0, 0x8))
            .run(&mut image, &decoder)
            .unwrap();

        let sources: Vec<_> = records.iter().map(|r| r.source).collect();
        assert_eq!(sources, vec![0x0, 0x4, 0x8]);
        assert_ne!(image.read_word(0x8).unwrap(), 0xea000006);
        assert_eq!(image.read_word(0xc).unwrap(), 0xea000006);
    }

    #[test]
    fn test_batch_restart_produces_no_duplicates() {
        // Ten branches, batch size 3: batches overlap at their boundaries and
        // the engine must still record each address exactly once.
        let words = [0xea000006u32; 10];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let records = RewriteEngine::new(options(0x0, 40))
            .with_batch_size(3)
            .run(&mut image, &decoder)
            .unwrap();

        assert_eq!(records.len(), 10);
        let sources: Vec<_> = records.iter().map(|r| r.source).collect();
        let mut sorted = sources.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);
        assert_eq!(sources, sorted, "records must stay in address order");
    }

    #[test]
    fn test_forward_progress_over_undecodable_bytes() {
        // 0xffffffff does not decode in ARM mode; the walk must step over it.
        let words = [0xffffffffu32, 0xea000006];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let records = RewriteEngine::new(options(0x0, 0x8))
            .run(&mut image, &decoder)
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, 0x4);
    }

    #[test]
    fn test_walk_stops_at_image_end_before_text_end() {
        let words = [0xea000006];
        let mut image = image_of(&words, 0x0);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        // text_end beyond the image: run terminates at the image boundary.
        let records = RewriteEngine::new(options(0x0, 0x100))
            .run(&mut image, &decoder)
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_text_start_outside_image_is_fatal() {
        let mut image = image_of(&[0xea000006], 0x8000);
        let decoder = CapstoneDecoder::new(Endianness::Little).unwrap();

        let err = RewriteEngine::new(options(0x0, 0x4))
            .run(&mut image, &decoder)
            .unwrap_err();
        assert!(matches!(err, RewriteError::AddressOutOfRange(0x0)));
    }
}
