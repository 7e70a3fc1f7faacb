//! Textual reports for the CFS, branch, and loop tables.
//!
//! Reports are one comma-separated line per record with all addresses
//! rendered as zero-padded 8-digit hex, matching what downstream tooling
//! scrapes. The generated C source form of the tables lives in `carray`.

mod carray;

pub use self::carray::*;

use crate::analysis::{BranchEntry, LoopEntry};
use crate::CfsRecord;

/// Raw instruction bytes as contiguous lowercase hex, in image byte order.
fn hex_bytes(bytes: &[u8; 4]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// CFS table report: `<hex original bytes>,<source>,<destination>`.
pub fn cfs_report(records: &[CfsRecord]) -> String {
    let mut out = String::new();
    for r in records {
        out.push_str(&format!(
            "{},0x{:08x},0x{:08x}\n",
            hex_bytes(&r.original_bytes),
            r.source,
            r.destination
        ));
    }
    out
}

/// Branch table report: `<source>,<destination>`.
pub fn branch_report(entries: &[BranchEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&format!("0x{:08x},0x{:08x}\n", e.source, e.destination));
    }
    out
}

/// Loop table report: `<entry>,<exit>`.
pub fn loop_report(entries: &[LoopEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&format!("0x{:08x},0x{:08x}\n", e.entry, e.exit));
    }
    out
}
