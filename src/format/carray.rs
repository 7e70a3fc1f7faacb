//! Generated C source form of the branch and loop tables.
//!
//! Each table becomes a standalone translation unit holding one fixed-size
//! constant array of `{ source, destination }` pairs, with an include of the
//! header that declares the element struct. The firmware side compiles these
//! files in directly.

use std::fs;
use std::path::Path;

use log::info;

use crate::analysis::{BranchEntry, LoopEntry};
use crate::RewriteError;

fn table_source(array_name: &str, element_type: &str, rows: &[(u64, u64)]) -> String {
    let mut out = String::new();
    out.push_str("/*\n");
    out.push_str(&format!(" * {}.c\n", array_name));
    out.push_str(" *\n");
    out.push_str(" * Auto-generated by armpatch; do not edit.\n");
    out.push_str(" */\n\n");
    out.push_str(&format!("#include \"{}.h\"\n\n", element_type));
    out.push_str(&format!(
        "const struct {} {}[{}] = {{\n",
        element_type,
        array_name,
        rows.len()
    ));
    for (src, dst) in rows {
        out.push_str(&format!("    {{ 0x{:08x}, 0x{:08x} }},\n", src, dst));
    }
    out.push_str("};\n");
    out
}

/// Render the branch table as C source.
pub fn branch_table_source(entries: &[BranchEntry]) -> String {
    let rows: Vec<_> = entries
        .iter()
        .map(|e| (e.source, e.destination))
        .collect();
    table_source("branch_table", "branch_table_entry", &rows)
}

/// Render the loop table as C source.
pub fn loop_table_source(entries: &[LoopEntry]) -> String {
    let rows: Vec<_> = entries.iter().map(|e| (e.entry, e.exit)).collect();
    table_source("loop_table", "loop_table_entry", &rows)
}

/// Write the branch table source file.
pub fn write_branch_table<P: AsRef<Path>>(
    path: P,
    entries: &[BranchEntry],
) -> Result<(), RewriteError> {
    let path = path.as_ref();
    fs::write(path, branch_table_source(entries))?;
    info!("wrote branch table ({} entries) to {}", entries.len(), path.display());
    Ok(())
}

/// Write the loop table source file.
pub fn write_loop_table<P: AsRef<Path>>(
    path: P,
    entries: &[LoopEntry],
) -> Result<(), RewriteError> {
    let path = path.as_ref();
    fs::write(path, loop_table_source(entries))?;
    info!("wrote loop table ({} entries) to {}", entries.len(), path.display());
    Ok(())
}
