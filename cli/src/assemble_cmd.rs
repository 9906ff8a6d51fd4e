//! `ctxpack assemble`: draft or sealed pack in, sealed manifest out.
//!
//! A draft (no `hash`) is built and sealed first. A sealed pack is verified
//! against its own hash and assembled exactly as written.

use std::path::PathBuf;

use clap::Parser;
use ctxpack_core::assemble::{AssembleOptions, EstimatorKind, assemble, assemble_value};
use ctxpack_core::builder::PackDraft;
use ctxpack_core::hash::verify_value;
use ctxpack_core::manifest::{Eviction, Manifest, Metrics, PointerRecord, Totals};
use ctxpack_core::types::SectionName;
use ctxpack_core::validate::{validate, validate_pack};
use ctxpack_core::{ErrorCode, PackError, Result as PackResult, Violation, build_pack};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::CtxpackConfig;
use crate::{
    EXIT_NONDETERMINISTIC, EXIT_OK, EXIT_SCHEMA, exit_code_for, read_json, report_pack_error,
    write_json,
};

/// `--section.cap <name>=<tokens>,<files>`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SectionCapArg {
    pub name: SectionName,
    /// Token ceiling for the section, 0 for none.
    pub tokens: u64,
    pub files: u64,
}

pub fn parse_section_cap(raw: &str) -> Result<SectionCapArg, String> {
    let (name, limits) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <name>=<tokens>,<files>, got '{raw}'"))?;
    let name: SectionName = name.trim().parse()?;
    let (tokens, files) = limits
        .split_once(',')
        .ok_or_else(|| format!("expected <tokens>,<files> after '=', got '{limits}'"))?;
    let tokens = tokens
        .trim()
        .parse()
        .map_err(|e| format!("invalid token cap '{tokens}': {e}"))?;
    let files = files
        .trim()
        .parse()
        .map_err(|e| format!("invalid file cap '{files}': {e}"))?;
    Ok(SectionCapArg {
        name,
        tokens,
        files,
    })
}

fn parse_estimator(raw: &str) -> Result<EstimatorKind, String> {
    EstimatorKind::parse(raw)
        .ok_or_else(|| format!("unknown estimator '{raw}' (expected chars|words)"))
}

#[derive(Debug, Parser)]
pub struct AssembleArgs {
    /// Model identifier recorded in the manifest
    #[arg(long = "model", value_name = "ID")]
    pub model: Option<String>,

    /// Pack draft, or a sealed pack to assemble as-is
    #[arg(long = "in", value_name = "FILE")]
    pub input: PathBuf,

    /// Manifest destination (defaults to stdout)
    #[arg(long = "out", value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Assemble without writing the manifest; prints a summary instead
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Write hash, totals, evictions, pointers, metrics and warnings here
    #[arg(long = "report", value_name = "FILE")]
    pub report: Option<PathBuf>,

    #[arg(long = "budget.max_tokens", value_name = "N")]
    pub budget_max_tokens: Option<u64>,

    #[arg(long = "budget.max_files", value_name = "N")]
    pub budget_max_files: Option<u64>,

    /// Repeatable
    #[arg(long = "section.cap", value_name = "NAME=TOKENS,FILES", value_parser = parse_section_cap)]
    pub section_caps: Vec<SectionCapArg>,

    /// Treat any warning as a failure (exit 2)
    #[arg(long = "fail-on-warn")]
    pub fail_on_warn: bool,

    /// Token estimator: chars or words
    #[arg(long = "estimator", value_name = "KIND", value_parser = parse_estimator)]
    pub estimator: Option<EstimatorKind>,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    hash: &'a str,
    totals: Totals,
    evictions: &'a [Eviction],
    pointers: &'a [PointerRecord],
    metrics: &'a Metrics,
    warnings: &'a [String],
}

#[derive(Debug, Serialize)]
struct DryRunSummary<'a> {
    hash: &'a str,
    model: &'a str,
    totals: Totals,
    evictions: usize,
    pointers: usize,
}

pub fn run_assemble(args: AssembleArgs, config: &CtxpackConfig) -> anyhow::Result<i32> {
    let Some(model) = args
        .model
        .clone()
        .or_else(|| config.assemble.default_model.clone())
    else {
        eprintln!("Error: no model given (pass --model or set assemble.default_model)");
        return Ok(EXIT_SCHEMA);
    };

    let raw = read_json(&args.input)?;
    let mut opts = AssembleOptions::new(model);
    opts.estimator = args.estimator.unwrap_or(config.assemble.estimator);
    opts.allow_minor_version = config.validate.allow_minor_version;

    let (manifest, warnings) = match assemble_input(raw, &args, &mut opts) {
        Ok(done) => done,
        Err(err) => {
            report_pack_error(&err);
            return Ok(exit_code_for(&err));
        }
    };

    if config.assemble.determinism_check {
        let again = match rebuild_hash(&args, &opts, &read_json(&args.input)?) {
            Ok(hash) => hash,
            Err(err) => {
                report_pack_error(&err);
                return Ok(exit_code_for(&err));
            }
        };
        if again != manifest.hash {
            eprintln!("determinism check failed");
            eprintln!("first:  {}", manifest.hash);
            eprintln!("second: {again}");
            return Ok(EXIT_NONDETERMINISTIC);
        }
    }

    for warning in &warnings {
        eprintln!("warning: {warning}");
    }

    if let Some(path) = &args.report {
        let report = Report {
            hash: &manifest.hash,
            totals: manifest.totals,
            evictions: &manifest.evictions,
            pointers: &manifest.pointers,
            metrics: &manifest.metrics,
            warnings: &warnings,
        };
        write_json(&report, Some(path))?;
    }

    if args.fail_on_warn && !warnings.is_empty() {
        eprintln!("{} warning(s) with --fail-on-warn", warnings.len());
        return Ok(EXIT_SCHEMA);
    }

    if args.dry_run {
        let summary = DryRunSummary {
            hash: &manifest.hash,
            model: &manifest.model,
            totals: manifest.totals,
            evictions: manifest.evictions.len(),
            pointers: manifest.pointers.len(),
        };
        write_json(&summary, None)?;
    } else {
        write_json(&manifest, args.out.as_deref())?;
    }

    info!(hash = %manifest.hash, dry_run = args.dry_run, "assemble finished");
    Ok(EXIT_OK)
}

/// Apply the command-line budget overrides to a draft.
fn apply_overrides(draft: &mut PackDraft, args: &AssembleArgs, opts: &mut AssembleOptions) {
    if let Some(n) = args.budget_max_tokens {
        draft.budgets.max_tokens = Some(n);
    }
    if let Some(n) = args.budget_max_files {
        draft.budgets.max_files = Some(n);
    }
    for cap in &args.section_caps {
        draft.budgets.section_caps.set(cap.name, cap.files);
        if cap.tokens > 0 {
            opts.section_token_caps.insert(cap.name, cap.tokens);
        } else {
            opts.section_token_caps.remove(&cap.name);
        }
    }
}

fn has_budget_overrides(args: &AssembleArgs) -> bool {
    args.budget_max_tokens.is_some()
        || args.budget_max_files.is_some()
        || !args.section_caps.is_empty()
}

fn assemble_input(
    raw: Value,
    args: &AssembleArgs,
    opts: &mut AssembleOptions,
) -> PackResult<(Manifest, Vec<String>)> {
    let (manifest, report) = if raw.get("hash").is_some() {
        verify_value(&raw)?;
        if has_budget_overrides(args) {
            return Err(PackError::Validation(
                Violation::new(
                    ErrorCode::SchemaInvalid,
                    "/budgets",
                    "budget flags cannot change a sealed pack; assemble its draft instead",
                )
                .into(),
            ));
        }
        let report = validate(&raw, &opts.validate_options())?;
        (assemble_value(&raw, opts)?, report)
    } else {
        let mut draft = PackDraft::from_value(raw)?;
        apply_overrides(&mut draft, args, opts);
        let pack = build_pack(draft)?;
        let report = validate_pack(&pack, &opts.validate_options())?;
        (assemble(&pack, opts)?, report)
    };

    let mut warnings = report.warnings;
    warnings.extend(manifest.evictions.iter().map(|e| {
        format!("evicted {}/{} ({})", e.section, e.id, e.reason.as_str())
    }));
    Ok((manifest, warnings))
}

fn rebuild_hash(
    args: &AssembleArgs,
    opts: &AssembleOptions,
    raw: &Value,
) -> PackResult<String> {
    let mut opts = opts.clone();
    let (manifest, _) = assemble_input(raw.clone(), args, &mut opts)?;
    Ok(manifest.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn section_cap_parsing() {
        assert_eq!(
            parse_section_cap("linked_tests=300, 4"),
            Ok(SectionCapArg {
                name: SectionName::LinkedTests,
                tokens: 300,
                files: 4,
            })
        );
        assert!(parse_section_cap("tests=1,1").is_err());
        assert!(parse_section_cap("extras=1").is_err());
        assert!(parse_section_cap("extras").is_err());
        assert!(parse_section_cap("extras=x,1").is_err());
    }

    #[test]
    fn overrides_reach_the_draft_and_options() {
        let args = AssembleArgs::try_parse_from([
            "assemble",
            "--in",
            "d.json",
            "--budget.max_files",
            "3",
            "--section.cap",
            "extras=0,1",
            "--section.cap",
            "templates=40,2",
        ])
        .expect("parse");
        let mut draft = PackDraft::default();
        let mut opts = AssembleOptions::new("m");
        apply_overrides(&mut draft, &args, &mut opts);

        let budgets = draft.budgets.resolve();
        assert_eq!(budgets.max_files, 3);
        assert_eq!(budgets.section_caps.get(SectionName::Extras), 1);
        assert_eq!(budgets.section_caps.get(SectionName::Templates), 2);
        assert_eq!(opts.section_token_caps.get(&SectionName::Templates), Some(&40));
        assert_eq!(opts.section_token_caps.get(&SectionName::Extras), None);
    }
}
