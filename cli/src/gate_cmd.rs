//! `ctxpack gate <file> [--mode off|warn|enforce]`

use std::path::PathBuf;

use clap::Parser;
use ctxpack_core::gate::{GateMode, GateOptions, gate};

use crate::config::CtxpackConfig;
use crate::{EXIT_FAILURE, EXIT_OK, read_json, report_pack_error, write_json};

#[derive(Debug, Parser)]
pub struct GateArgs {
    /// Sealed pack to check
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Overrides `gate.mode` from the configuration
    #[arg(long = "mode", value_name = "MODE")]
    pub mode: Option<GateMode>,
}

/// Prints the outcome as JSON. Exit 1 when the gate fails or the outcome
/// is not ok.
pub fn run_gate(args: GateArgs, config: &CtxpackConfig) -> anyhow::Result<i32> {
    let value = read_json(&args.file)?;
    let opts = GateOptions {
        mode: args.mode.unwrap_or(config.gate.mode),
        allow_minor_version: config.validate.allow_minor_version,
    };

    match gate(&value, &opts) {
        Ok(outcome) => {
            write_json(&outcome, None)?;
            Ok(if outcome.ok { EXIT_OK } else { EXIT_FAILURE })
        }
        Err(err) => {
            report_pack_error(&err);
            Ok(EXIT_FAILURE)
        }
    }
}
