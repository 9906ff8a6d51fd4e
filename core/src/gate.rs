//! Post-hoc invariant checks for sealed packs.
//!
//! The gate works on the raw document, so it can vet packs produced by
//! anything, not only by the builder. Cap checks count raw section items;
//! they are a pre-flight, not a replay of assembly.
//!
//! Integrity is never negotiable: a hash mismatch makes the outcome
//! `ok: false` in every mode, and an error in `enforce`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ErrorCode, PackError, Result, Violation};
use crate::hash::verify_value;
use crate::types::{Item, NeverInclude, Pack, SectionName};
use crate::validate::{ValidateOptions, validate};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Only the hash is checked.
    Off,
    /// Violations are reported as warnings.
    #[default]
    Warn,
    /// The first violation fails the call.
    Enforce,
}

impl GateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Enforce => "enforce",
        }
    }
}

impl FromStr for GateMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "warn" => Ok(Self::Warn),
            "enforce" => Ok(Self::Enforce),
            other => Err(format!("unknown gate mode '{other}' (expected off|warn|enforce)")),
        }
    }
}

impl std::fmt::Display for GateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GateOptions {
    pub mode: GateMode,
    pub allow_minor_version: bool,
}

impl GateOptions {
    pub fn new(mode: GateMode) -> Self {
        Self {
            mode,
            allow_minor_version: false,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Violation>,
}

/// Gate a raw pack document.
pub fn gate(pack: &Value, opts: &GateOptions) -> Result<GateOutcome> {
    let integrity = match verify_value(pack) {
        Ok(()) => None,
        Err(PackError::HashMismatch { declared, computed }) => {
            if opts.mode == GateMode::Enforce {
                return Err(PackError::HashMismatch { declared, computed });
            }
            Some(Violation::new(
                ErrorCode::HashMismatch,
                "/hash",
                format!("declared {declared}, content hashes to {computed}"),
            ))
        }
        Err(other) => return Err(other),
    };

    let mut violations: Vec<Violation> = integrity.iter().cloned().collect();
    if opts.mode != GateMode::Off {
        let checks: [fn(&Value, &GateOptions) -> Vec<Violation>; 6] = [
            check_structure,
            check_order,
            check_section_caps,
            check_max_files,
            check_never_include,
            check_must_sections,
        ];
        for check in checks {
            let found = check(pack, opts);
            if opts.mode == GateMode::Enforce
                && let Some(first) = found.first()
            {
                warn!(code = first.code.as_str(), path = %first.path, "gate violation");
                return Err(PackError::Gate(first.clone()));
            }
            violations.extend(found);
        }
    }

    for v in &violations {
        warn!(code = v.code.as_str(), path = %v.path, message = %v.message, "gate warning");
    }
    let ok = !violations.iter().any(|v| v.code.is_integrity());
    info!(mode = opts.mode.as_str(), ok, warnings = violations.len(), "gate finished");
    Ok(GateOutcome {
        ok,
        warnings: violations,
    })
}

/// Gate a typed pack.
pub fn gate_pack(pack: &Pack, opts: &GateOptions) -> Result<GateOutcome> {
    gate(&pack.to_value()?, opts)
}

fn sections(pack: &Value) -> impl Iterator<Item = (usize, &Value)> {
    pack.get("sections")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
}

fn section_name(section: &Value) -> Option<SectionName> {
    section
        .get("name")
        .and_then(Value::as_str)
        .and_then(SectionName::parse)
}

fn section_items(section: &Value) -> &[Value] {
    section
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Schema violations, minus the ones reported under gate-specific codes.
fn check_structure(pack: &Value, opts: &GateOptions) -> Vec<Violation> {
    let validate_opts = ValidateOptions {
        strict_order: false,
        allow_minor_version: opts.allow_minor_version,
    };
    match validate(pack, &validate_opts) {
        Ok(_) => Vec::new(),
        Err(err) => err
            .violations()
            .unwrap_or_default()
            .iter()
            .filter(|v| !(v.path.starts_with("/must_include/") && v.path.ends_with("/section")))
            .cloned()
            .collect(),
    }
}

fn check_order(pack: &Value, _opts: &GateOptions) -> Vec<Violation> {
    let mut out = Vec::new();

    let mut last: Option<SectionName> = None;
    let order = pack.get("order").and_then(Value::as_array).into_iter().flatten();
    for (i, name) in order.enumerate() {
        let Some(name) = name.as_str().and_then(SectionName::parse) else {
            continue;
        };
        if let Some(prev) = last
            && name < prev
        {
            out.push(Violation::new(
                ErrorCode::OrderViolation,
                format!("/order/{i}"),
                format!("'{name}' listed after '{prev}'"),
            ));
        }
        last = Some(name);
    }

    let mut last: Option<SectionName> = None;
    for (i, section) in sections(pack) {
        let Some(name) = section_name(section) else {
            continue;
        };
        if let Some(prev) = last
            && name < prev
        {
            out.push(Violation::new(
                ErrorCode::OrderViolation,
                format!("/sections/{i}/name"),
                format!("section '{name}' appears after '{prev}'"),
            ));
        }
        last = Some(name);
    }
    out
}

fn check_section_caps(pack: &Value, _opts: &GateOptions) -> Vec<Violation> {
    let mut counts: BTreeMap<SectionName, u64> = BTreeMap::new();
    for (_, section) in sections(pack) {
        if let Some(name) = section_name(section) {
            *counts.entry(name).or_default() += section_items(section).len() as u64;
        }
    }

    let caps = pack.pointer("/budgets/section_caps");
    let mut out = Vec::new();
    for (name, count) in counts {
        let Some(cap) = caps.and_then(|c| c.get(name.as_str())).and_then(Value::as_u64) else {
            continue;
        };
        if count > cap {
            out.push(Violation::new(
                ErrorCode::SectionCapExceeded,
                format!("/budgets/section_caps/{name}"),
                format!("section '{name}' holds {count} items, cap is {cap}"),
            ));
        }
    }
    out
}

fn check_max_files(pack: &Value, _opts: &GateOptions) -> Vec<Violation> {
    let Some(max_files) = pack.pointer("/budgets/max_files").and_then(Value::as_u64) else {
        return Vec::new();
    };
    let total: u64 = sections(pack)
        .map(|(_, section)| section_items(section).len() as u64)
        .sum();
    if max_files > 0 && total > max_files {
        vec![Violation::new(
            ErrorCode::MaxFilesExceeded,
            "/budgets/max_files",
            format!("pack holds {total} items, max_files is {max_files}"),
        )]
    } else {
        Vec::new()
    }
}

fn check_never_include(pack: &Value, _opts: &GateOptions) -> Vec<Violation> {
    let rules: Vec<NeverInclude> = pack
        .get("never_include")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|rule| serde_json::from_value(rule.clone()).ok())
        .collect();
    if rules.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (i, section) in sections(pack) {
        for (j, raw) in section_items(section).iter().enumerate() {
            let Ok(item) = serde_json::from_value::<Item>(raw.clone()) else {
                continue;
            };
            if rules.iter().any(|rule| rule.matches_item(&item)) {
                out.push(Violation::new(
                    ErrorCode::NeverIncludeMatch,
                    format!("/sections/{i}/items/{j}"),
                    format!(
                        "item '{}' ({}) matches a never_include rule",
                        item.id,
                        item.effective_path().unwrap_or_default()
                    ),
                ));
            }
        }
    }
    out
}

fn check_must_sections(pack: &Value, _opts: &GateOptions) -> Vec<Violation> {
    let entries = pack
        .get("must_include")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    let mut out = Vec::new();
    for (i, entry) in entries.enumerate() {
        let section = entry.get("section").and_then(Value::as_str);
        if section.and_then(SectionName::parse).is_none() {
            out.push(Violation::new(
                ErrorCode::MustSectionInvalid,
                format!("/must_include/{i}/section"),
                format!(
                    "must_include section {} is not a canonical section",
                    section.map_or_else(|| "(missing)".to_string(), |s| format!("'{s}'"))
                ),
            ));
        }
    }
    out
}
