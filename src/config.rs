//! Configuration resolution: TOML config file plus CLI overrides.
//!
//! Every option can come from either the config file or the command line,
//! with the command line winning. The merged result is validated up front:
//! the run never opens the image with a required option unresolved, and the
//! error names the offending option so the user knows which flag or key to
//! set.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::HookTable;
use crate::{Address, Endianness};

/// Configuration errors, all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No value for a required option, neither flag nor config key
    #[error("required option `{0}` is not set (flag or config file)")]
    MissingOption(&'static str),

    /// A value that should be a hex address does not parse
    #[error("invalid value `{value}` for `{option}`: {reason}")]
    InvalidValue {
        option: &'static str,
        value: String,
        reason: String,
    },

    /// Config file unreadable
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Config file does not parse (malformed section header, bad key, ...)
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Parse an absolute hex address, with or without a `0x` prefix.
pub fn parse_address(s: &str) -> Result<Address, String> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() {
        return Err("empty address".to_string());
    }
    Address::from_str_radix(digits, 16).map_err(|e| format!("not a hex address: {}", e))
}

/// Parse a comma-separated list of hex addresses (the CLI omit-list form).
pub fn parse_address_list(s: &str) -> Result<Vec<Address>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_address)
        .collect()
}

/// Hook addresses as they appear in the `[hooks]` config section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHooks {
    pub b: Option<String>,
    pub bl: Option<String>,
    pub bx_lr: Option<String>,
    pub pop_r3_r4_fp_pc: Option<String>,
    pub pop_r4_fp_pc: Option<String>,
    pub pop_fp_pc: Option<String>,
    pub pop_fp_lr: Option<String>,
    pub blx_r3: Option<String>,
}

/// The config file as written: everything optional, addresses as hex strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub input: Option<PathBuf>,
    pub load_address: Option<String>,
    pub text_start: Option<String>,
    pub text_end: Option<String>,
    pub omit_addresses: Option<Vec<String>>,
    pub big_endian: Option<bool>,
    pub dry_run: Option<bool>,
    pub print_cfs: Option<bool>,
    pub print_branch_table: Option<bool>,
    pub print_loop_table: Option<bool>,
    pub gen_branch_table: Option<bool>,
    pub gen_loop_table: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub hooks: Option<FileHooks>,
}

impl FileConfig {
    /// Load and parse a TOML config file. Any syntax problem (including a
    /// malformed section header) is fatal and names the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Options as given on the command line (already typed by clap).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub input: Option<PathBuf>,
    pub load_address: Option<Address>,
    pub text_start: Option<Address>,
    pub text_end: Option<Address>,
    pub omit_addresses: Option<Vec<Address>>,
    pub hook_b: Option<Address>,
    pub hook_bl: Option<Address>,
    pub hook_bx_lr: Option<Address>,
    pub hook_pop_r3_r4_fp_pc: Option<Address>,
    pub hook_pop_r4_fp_pc: Option<Address>,
    pub hook_pop_fp_pc: Option<Address>,
    pub hook_pop_fp_lr: Option<Address>,
    pub hook_blx_r3: Option<Address>,
    pub big_endian: bool,
    pub dry_run: bool,
    pub print_cfs: bool,
    pub print_branch_table: bool,
    pub print_loop_table: bool,
    pub gen_branch_table: bool,
    pub gen_loop_table: bool,
    pub output_dir: Option<PathBuf>,
}

/// The fully resolved configuration a run executes against.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub load_address: Address,
    pub text_start: Address,
    pub text_end: Address,
    pub omit: Vec<Address>,
    pub endianness: Endianness,
    pub dry_run: bool,
    pub print_cfs: bool,
    pub print_branch_table: bool,
    pub print_loop_table: bool,
    pub gen_branch_table: bool,
    pub gen_loop_table: bool,
    pub output_dir: PathBuf,
    pub hooks: HookTable,
}

fn file_address(
    option: &'static str,
    value: &Option<String>,
) -> Result<Option<Address>, ConfigError> {
    match value {
        None => Ok(None),
        Some(s) => parse_address(s)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                option,
                value: s.clone(),
                reason,
            }),
    }
}

fn require<T>(option: &'static str, value: Option<T>) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingOption(option))
}

/// CLI value if present; otherwise parse the config-file value. The file
/// value is only looked at (and can only fail) when the CLI does not
/// override it.
fn resolved(
    option: &'static str,
    cli: Option<Address>,
    file: &Option<String>,
) -> Result<Option<Address>, ConfigError> {
    match cli {
        Some(v) => Ok(Some(v)),
        None => file_address(option, file),
    }
}

/// Merge CLI overrides on top of the config file and validate the result.
pub fn resolve(cli: Overrides, file: FileConfig) -> Result<Settings, ConfigError> {
    let hooks = file.hooks.unwrap_or_default();

    let input = require("input", cli.input.or(file.input))?;
    let load_address = require(
        "load_address",
        resolved("load_address", cli.load_address, &file.load_address)?,
    )?;
    let text_start = require(
        "text_start",
        resolved("text_start", cli.text_start, &file.text_start)?,
    )?;
    let text_end = require(
        "text_end",
        resolved("text_end", cli.text_end, &file.text_end)?,
    )?;

    let omit = match (cli.omit_addresses, &file.omit_addresses) {
        (Some(list), _) => list,
        (None, Some(raw)) => {
            let mut list = Vec::with_capacity(raw.len());
            for s in raw {
                list.push(parse_address(s).map_err(|reason| ConfigError::InvalidValue {
                    option: "omit_addresses",
                    value: s.clone(),
                    reason,
                })?);
            }
            list
        }
        (None, None) => Vec::new(),
    };

    let hook_table = HookTable {
        b: require("hook_b", resolved("hook_b", cli.hook_b, &hooks.b)?)?,
        bl: require("hook_bl", resolved("hook_bl", cli.hook_bl, &hooks.bl)?)?,
        bx_lr: require(
            "hook_bx_lr",
            resolved("hook_bx_lr", cli.hook_bx_lr, &hooks.bx_lr)?,
        )?,
        pop_r3_r4_fp_pc: require(
            "hook_pop_r3_r4_fp_pc",
            resolved(
                "hook_pop_r3_r4_fp_pc",
                cli.hook_pop_r3_r4_fp_pc,
                &hooks.pop_r3_r4_fp_pc,
            )?,
        )?,
        pop_r4_fp_pc: require(
            "hook_pop_r4_fp_pc",
            resolved("hook_pop_r4_fp_pc", cli.hook_pop_r4_fp_pc, &hooks.pop_r4_fp_pc)?,
        )?,
        pop_fp_pc: require(
            "hook_pop_fp_pc",
            resolved("hook_pop_fp_pc", cli.hook_pop_fp_pc, &hooks.pop_fp_pc)?,
        )?,
        pop_fp_lr: require(
            "hook_pop_fp_lr",
            resolved("hook_pop_fp_lr", cli.hook_pop_fp_lr, &hooks.pop_fp_lr)?,
        )?,
        blx_r3: require(
            "hook_blx_r3",
            resolved("hook_blx_r3", cli.hook_blx_r3, &hooks.blx_r3)?,
        )?,
    };

    let endianness = if cli.big_endian || file.big_endian.unwrap_or(false) {
        Endianness::Big
    } else {
        Endianness::Little
    };

    Ok(Settings {
        input,
        load_address,
        text_start,
        text_end,
        omit,
        endianness,
        dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
        print_cfs: cli.print_cfs || file.print_cfs.unwrap_or(false),
        print_branch_table: cli.print_branch_table || file.print_branch_table.unwrap_or(false),
        print_loop_table: cli.print_loop_table || file.print_loop_table.unwrap_or(false),
        gen_branch_table: cli.gen_branch_table || file.gen_branch_table.unwrap_or(false),
        gen_loop_table: cli.gen_loop_table || file.gen_loop_table.unwrap_or(false),
        output_dir: cli
            .output_dir
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from(".")),
        hooks: hook_table,
    })
}
