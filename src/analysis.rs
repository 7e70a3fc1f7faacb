//! Post-pass control-flow analysis over recorded CFS lists.
//!
//! The loop heuristic is purely topological: a loop is identified by a
//! backward `b` edge's target (the entry) and the instruction after the
//! highest-addressed backward branch sharing that target (the exit). `bl`
//! back-edges are deliberately not considered, and all back-edges sharing an
//! entry collapse into one record; downstream consumers depend on this exact
//! behavior, so it must not be "improved".

use std::collections::BTreeMap;

use crate::{Address, CfsKind, CfsRecord, INSN_WIDTH};

/// One `(source, destination)` pair of a direct branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEntry {
    /// Address of the branch instruction
    pub source: Address,
    /// Statically decoded target
    pub destination: Address,
}

/// One detected loop: its back-edge target and the address after its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEntry {
    /// Address the back-edges jump to
    pub entry: Address,
    /// Address immediately following the last backward branch of the body
    pub exit: Address,
}

/// Filter the CFS list down to direct `b`/`bl` records, preserving order.
pub fn branch_table(records: &[CfsRecord]) -> Vec<BranchEntry> {
    records
        .iter()
        .filter(|r| matches!(r.kind, CfsKind::Branch | CfsKind::BranchLink))
        .map(|r| BranchEntry {
            source: r.source,
            destination: r.destination,
        })
        .collect()
}

/// Detect loops from backward `b` records, ascending by entry address.
pub fn loop_table(records: &[CfsRecord]) -> Vec<LoopEntry> {
    // entry -> highest backward-branch source targeting it
    let mut latest_source: BTreeMap<Address, Address> = BTreeMap::new();

    for r in records {
        if r.kind != CfsKind::Branch || r.destination >= r.source {
            continue;
        }
        let slot = latest_source.entry(r.destination).or_insert(r.source);
        if r.source > *slot {
            *slot = r.source;
        }
    }

    latest_source
        .into_iter()
        .map(|(entry, source)| LoopEntry {
            entry,
            exit: source + INSN_WIDTH as Address,
        })
        .collect()
}
