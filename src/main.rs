//! Command-line front end for the armpatch rewrite engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use armpatch::analysis;
use armpatch::config::{self, FileConfig, Overrides, Settings};
use armpatch::decoder::CapstoneDecoder;
use armpatch::engine::{RewriteEngine, RewriteOptions};
use armpatch::format;
use armpatch::image::BinaryImage;
use armpatch::Address;

/// Statically rewrite control-flow instructions in a bare-metal ARM image
/// with calls to configured hook addresses.
#[derive(Parser)]
#[command(name = "armpatch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Image file to patch in place
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// TOML configuration file (CLI flags override its values)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Absolute address the first image byte maps to (hex)
    #[arg(long, value_parser = config::parse_address)]
    load_address: Option<Address>,

    /// First address of the code range to scan (hex)
    #[arg(long, value_parser = config::parse_address)]
    text_start: Option<Address>,

    /// One past the last address of the code range (hex)
    #[arg(long, value_parser = config::parse_address)]
    text_end: Option<Address>,

    /// Comma-separated hex addresses of instructions to skip
    #[arg(long)]
    omit_addresses: Option<String>,

    /// Hook target for `b` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_b: Option<Address>,

    /// Hook target for `bl` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_bl: Option<Address>,

    /// Hook target for `bx lr` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_bx_lr: Option<Address>,

    /// Hook target for `pop {r3, r4, fp, pc}` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_pop_r3_r4_fp_pc: Option<Address>,

    /// Hook target for `pop {r4, fp, pc}` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_pop_r4_fp_pc: Option<Address>,

    /// Hook target for `pop {fp, pc}` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_pop_fp_pc: Option<Address>,

    /// Hook target for `pop {fp, lr}` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_pop_fp_lr: Option<Address>,

    /// Hook target for `blx r3` (hex)
    #[arg(long, value_parser = config::parse_address)]
    hook_blx_r3: Option<Address>,

    /// Treat the image (and its instruction words) as big-endian
    #[arg(long)]
    big_endian: bool,

    /// Compute and report everything, but leave the image untouched
    #[arg(long)]
    dry_run: bool,

    /// Print the CFS table to stdout
    #[arg(long)]
    print_cfs: bool,

    /// Print the branch table to stdout
    #[arg(long)]
    print_branch_table: bool,

    /// Print the loop table to stdout
    #[arg(long)]
    print_loop_table: bool,

    /// Generate branch_table.c in the output directory
    #[arg(long)]
    gen_branch_table: bool,

    /// Generate loop_table.c in the output directory
    #[arg(long)]
    gen_loop_table: bool,

    /// Directory the generated table sources go to
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Result<Overrides> {
        let omit_addresses = match &self.omit_addresses {
            Some(raw) => Some(
                config::parse_address_list(raw)
                    .map_err(|e| anyhow::anyhow!("invalid --omit-addresses: {}", e))?,
            ),
            None => None,
        };
        Ok(Overrides {
            input: self.input.clone(),
            load_address: self.load_address,
            text_start: self.text_start,
            text_end: self.text_end,
            omit_addresses,
            hook_b: self.hook_b,
            hook_bl: self.hook_bl,
            hook_bx_lr: self.hook_bx_lr,
            hook_pop_r3_r4_fp_pc: self.hook_pop_r3_r4_fp_pc,
            hook_pop_r4_fp_pc: self.hook_pop_r4_fp_pc,
            hook_pop_fp_pc: self.hook_pop_fp_pc,
            hook_pop_fp_lr: self.hook_pop_fp_lr,
            hook_blx_r3: self.hook_blx_r3,
            big_endian: self.big_endian,
            dry_run: self.dry_run,
            print_cfs: self.print_cfs,
            print_branch_table: self.print_branch_table,
            print_loop_table: self.print_loop_table,
            gen_branch_table: self.gen_branch_table,
            gen_loop_table: self.gen_loop_table,
            output_dir: self.output_dir.clone(),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = config::resolve(cli.overrides()?, file)?;

    run(&settings)
}

fn run(settings: &Settings) -> Result<()> {
    let mut image = BinaryImage::open(&settings.input, settings.load_address, settings.endianness)
        .with_context(|| format!("cannot open image {}", settings.input.display()))?;
    let decoder = CapstoneDecoder::new(settings.endianness)?;

    let options = RewriteOptions {
        text_start: settings.text_start,
        text_end: settings.text_end,
        hooks: settings.hooks,
        omit: settings.omit.clone(),
        dry_run: settings.dry_run,
    };
    let records = RewriteEngine::new(options).run(&mut image, &decoder)?;

    let branches = analysis::branch_table(&records);
    let loops = analysis::loop_table(&records);
    info!(
        "{} control-flow statements, {} branch entries, {} loop entries",
        records.len(),
        branches.len(),
        loops.len()
    );

    if settings.print_cfs {
        print!("{}", format::cfs_report(&records));
    }
    if settings.print_branch_table {
        print!("{}", format::branch_report(&branches));
    }
    if settings.print_loop_table {
        print!("{}", format::loop_report(&loops));
    }

    if settings.gen_branch_table {
        format::write_branch_table(settings.output_dir.join("branch_table.c"), &branches)
            .context("cannot write branch table")?;
    }
    if settings.gen_loop_table {
        format::write_loop_table(settings.output_dir.join("loop_table.c"), &loops)
            .context("cannot write loop table")?;
    }

    if settings.dry_run {
        info!("dry run: image left untouched");
    } else {
        image
            .save(None::<&Path>)
            .with_context(|| format!("cannot write image {}", settings.input.display()))?;
    }
    Ok(())
}
