//! `ctxpack plan --signals <file> [--out <file>]`

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ctxpack_core::planner::{PlanInputs, plan_pack};

use crate::{EXIT_OK, exit_code_for, read_json, report_pack_error, write_json};

#[derive(Debug, Parser)]
pub struct PlanArgs {
    /// Signals JSON: labels, diff, file_contents, failing_tests, templates,
    /// budgets, never_include and optional project/pr/mode
    #[arg(long = "signals", value_name = "FILE")]
    pub signals: PathBuf,

    /// Sealed pack destination (defaults to stdout)
    #[arg(long = "out", value_name = "FILE")]
    pub out: Option<PathBuf>,
}

pub fn run_plan(args: PlanArgs) -> anyhow::Result<i32> {
    let raw = read_json(&args.signals)?;
    let inputs: PlanInputs = serde_json::from_value(raw)
        .with_context(|| format!("{} is not a valid signals file", args.signals.display()))?;

    let (pack, omissions) = match plan_pack(&inputs) {
        Ok(planned) => planned,
        Err(err) => {
            report_pack_error(&err);
            return Ok(exit_code_for(&err));
        }
    };

    for omission in &omissions {
        eprintln!(
            "omitted {}/{} ({})",
            omission.section,
            omission.id,
            omission.reason.as_str()
        );
    }
    write_json(&pack, args.out.as_deref())?;
    Ok(EXIT_OK)
}
