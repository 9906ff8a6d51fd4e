//! `ctxpack` command line.
//!
//! A thin adapter over `ctxpack-core`: reads JSON from disk, calls the core,
//! and maps stable error codes to process exit codes.
//!
//! ## Exit Codes
//!
//! - 0: Success
//! - 1: Validation or gate failure, unreadable input
//! - 2: Schema or integrity error, or a warning under `--fail-on-warn`
//! - 3: `BUDGET_ERROR`
//! - 4: Determinism self-check failed

pub mod assemble_cmd;
pub mod config;
pub mod gate_cmd;
pub mod pack_cmd;
pub mod plan_cmd;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ctxpack_core::{ErrorCode, PackError};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::assemble_cmd::AssembleArgs;
use crate::config::{ConfigLoader, CtxpackConfig};
use crate::gate_cmd::GateArgs;
use crate::plan_cmd::PlanArgs;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SCHEMA: i32 = 2;
pub const EXIT_BUDGET: i32 = 3;
pub const EXIT_NONDETERMINISTIC: i32 = 4;

/// Deterministic context packs for code-change prompts
#[derive(Debug, Parser)]
#[command(name = "ctxpack", version)]
pub struct Cli {
    /// Configuration file (defaults to ./ctxpack.toml, then the user config dir)
    #[arg(long = "config", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check a pack against the schema and its seal
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the seal hash a pack's content hashes to
    Hash {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print a pack as canonical JSON
    Print {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Assemble a manifest from a draft or a sealed pack
    Assemble(AssembleArgs),

    /// Run invariant checks on a sealed pack
    Gate(GateArgs),

    /// Plan a pack from change signals
    Plan(PlanArgs),
}

impl Cli {
    pub fn run(self) -> i32 {
        let config = match ConfigLoader::load_default(self.config.as_deref()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error: {err}");
                return EXIT_FAILURE;
            }
        };
        self.command.run(&config)
    }
}

impl Command {
    pub fn run(self, config: &CtxpackConfig) -> i32 {
        let result = match self {
            Command::Validate { file } => pack_cmd::run_validate(&file, config),
            Command::Hash { file } => pack_cmd::run_hash(&file),
            Command::Print { file } => pack_cmd::run_print(&file),
            Command::Assemble(args) => assemble_cmd::run_assemble(args, config),
            Command::Gate(args) => gate_cmd::run_gate(args, config),
            Command::Plan(args) => plan_cmd::run_plan(args),
        };
        result.unwrap_or_else(|err| {
            eprintln!("Error: {err:#}");
            EXIT_FAILURE
        })
    }
}

/// Install a stderr subscriber so stdout stays machine-readable.
pub fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

pub(crate) fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Pretty JSON to `out`, or to stdout when `out` is `None`.
pub(crate) fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> anyhow::Result<()> {
    let mut rendered = serde_json::to_string_pretty(value)?;
    rendered.push('\n');
    match out {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Print every violation, or the single coded error, to stderr.
pub(crate) fn report_pack_error(err: &PackError) {
    match err {
        PackError::Budget { locator, reason } => {
            eprintln!("{}: must_include {locator}: {reason}", ErrorCode::BudgetError.as_str());
        }
        PackError::HashMismatch { declared, computed } => {
            eprintln!("{}: declared {declared}", ErrorCode::HashMismatch.as_str());
            eprintln!("{}: computed {computed}", ErrorCode::HashMismatch.as_str());
        }
        _ => match err.violations() {
            Some(violations) => {
                for v in violations {
                    eprintln!("{} {}: {}", v.code.as_str(), v.path, v.message);
                }
            }
            None => eprintln!("{}: {err}", err.code().as_str()),
        },
    }
}

/// Exit code for a core error.
pub fn exit_code_for(err: &PackError) -> i32 {
    match err.code() {
        ErrorCode::BudgetError => EXIT_BUDGET,
        _ => EXIT_SCHEMA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn budget_errors_map_to_three() {
        let err = PackError::budget("file:extras:a.ts:1", "evicted (max_tokens)");
        assert_eq!(exit_code_for(&err), EXIT_BUDGET);
        let err = PackError::HashMismatch {
            declared: "a".into(),
            computed: "b".into(),
        };
        assert_eq!(exit_code_for(&err), EXIT_SCHEMA);
    }

    #[test]
    fn parses_assemble_flags() {
        let cli = Cli::try_parse_from([
            "ctxpack",
            "assemble",
            "--model",
            "m",
            "--in",
            "draft.json",
            "--budget.max_tokens",
            "100",
            "--section.cap",
            "extras=50,2",
            "--dry-run",
        ])
        .expect("flags should parse");
        let Command::Assemble(args) = cli.command else {
            panic!("expected assemble");
        };
        assert_eq!(args.budget_max_tokens, Some(100));
        assert_eq!(args.section_caps.len(), 1);
        assert_eq!(args.section_caps[0].files, 2);
        assert!(args.dry_run);
    }
}
