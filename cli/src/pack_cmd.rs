//! `validate`, `hash` and `print`: read-only views of a pack file.

use std::path::Path;

use ctxpack_core::canonicalize_value;
use ctxpack_core::hash::{seal_hash_value, verify_value};
use ctxpack_core::validate::{ValidateOptions, validate};

use crate::config::CtxpackConfig;
use crate::{EXIT_FAILURE, EXIT_OK, read_json, report_pack_error};

/// Exit 0 for a valid, correctly sealed pack; otherwise print every
/// violation and exit 1.
pub fn run_validate(file: &Path, config: &CtxpackConfig) -> anyhow::Result<i32> {
    let value = read_json(file)?;
    let opts = ValidateOptions {
        strict_order: true,
        allow_minor_version: config.validate.allow_minor_version,
    };

    let report = match validate(&value, &opts).and_then(|report| {
        verify_value(&value)?;
        Ok(report)
    }) {
        Ok(report) => report,
        Err(err) => {
            report_pack_error(&err);
            return Ok(EXIT_FAILURE);
        }
    };

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    println!("ok");
    Ok(EXIT_OK)
}

pub fn run_hash(file: &Path) -> anyhow::Result<i32> {
    let value = read_json(file)?;
    println!("{}", seal_hash_value(&value)?);
    Ok(EXIT_OK)
}

pub fn run_print(file: &Path) -> anyhow::Result<i32> {
    let value = read_json(file)?;
    println!("{}", canonicalize_value(&value)?);
    Ok(EXIT_OK)
}
