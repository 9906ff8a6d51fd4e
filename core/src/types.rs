//! Pack data model.
//!
//! The pack is the sealed unit of work handed to the assembler. Every record
//! is a closed type (`deny_unknown_fields`), and the six section names form
//! an exhaustive enum whose declaration order is the canonical order.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::hash::Sealable;
use crate::paths::{glob_matches, normalize_path};

/// Supported pack schema version.
pub const PACK_VERSION: &str = "1.0.0";

/// Supported major version prefix for the compatibility flag.
pub const PACK_MAJOR_PREFIX: &str = "1.";

/// Canonical section names. `Ord` follows the canonical index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionName {
    Templates,
    SpecCanvas,
    DiffSlices,
    LinkedTests,
    Contracts,
    Extras,
}

impl SectionName {
    /// All sections in canonical order
    pub const ALL: [Self; 6] = [
        Self::Templates,
        Self::SpecCanvas,
        Self::DiffSlices,
        Self::LinkedTests,
        Self::Contracts,
        Self::Extras,
    ];

    /// Position in the canonical order
    pub fn index(&self) -> usize {
        match self {
            Self::Templates => 0,
            Self::SpecCanvas => 1,
            Self::DiffSlices => 2,
            Self::LinkedTests => 3,
            Self::Contracts => 4,
            Self::Extras => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Templates => "templates",
            Self::SpecCanvas => "spec_canvas",
            Self::DiffSlices => "diff_slices",
            Self::LinkedTests => "linked_tests",
            Self::Contracts => "contracts",
            Self::Extras => "extras",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == s)
    }
}

impl std::fmt::Display for SectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown section '{s}'"))
    }
}

/// Planning mode for the change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Mvp,
    Pr,
    Fix,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mvp => "MVP",
            Self::Pr => "PR",
            Self::Fix => "FIX",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub id: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullRequest {
    pub id: String,
    pub branch: String,
    /// Opaque commit token (at least 7 characters).
    pub commit_sha: String,
}

/// Per-section file caps. A cap of 0 admits nothing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionCaps {
    pub templates: u64,
    pub spec_canvas: u64,
    pub diff_slices: u64,
    pub linked_tests: u64,
    pub contracts: u64,
    pub extras: u64,
}

impl SectionCaps {
    pub fn get(&self, name: SectionName) -> u64 {
        match name {
            SectionName::Templates => self.templates,
            SectionName::SpecCanvas => self.spec_canvas,
            SectionName::DiffSlices => self.diff_slices,
            SectionName::LinkedTests => self.linked_tests,
            SectionName::Contracts => self.contracts,
            SectionName::Extras => self.extras,
        }
    }

    pub fn set(&mut self, name: SectionName, cap: u64) {
        let slot = match name {
            SectionName::Templates => &mut self.templates,
            SectionName::SpecCanvas => &mut self.spec_canvas,
            SectionName::DiffSlices => &mut self.diff_slices,
            SectionName::LinkedTests => &mut self.linked_tests,
            SectionName::Contracts => &mut self.contracts,
            SectionName::Extras => &mut self.extras,
        };
        *slot = cap;
    }
}

/// Token and file budgets. Global limits of 0 mean "unlimited".
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Budgets {
    pub max_tokens: u64,
    pub max_files: u64,
    pub max_per_file_tokens: u64,
    pub section_caps: SectionCaps,
}

/// Line location inside a file. Lines are 1-based and inclusive.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Loc {
    pub path: String,
    pub start_line: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Span {
    pub text: String,
}

/// The atomic content unit inside a section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Item {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Fragments joined with `\n` when `content` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spans: Option<Vec<Span>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<Loc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Hops from the diff; only used to break eviction ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_to_diff: Option<u64>,
}

impl Item {
    /// Path used for ordering and matching: `path`, then `loc.path`.
    pub fn effective_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .or_else(|| self.loc.as_ref().map(|loc| loc.path.as_str()))
    }

    pub fn normalized_path(&self) -> String {
        self.effective_path().map(normalize_path).unwrap_or_default()
    }

    pub fn start_line(&self) -> Option<u64> {
        self.loc.as_ref().map(|loc| loc.start_line)
    }

    pub fn end_line(&self) -> Option<u64> {
        self.loc.as_ref().and_then(|loc| loc.end_line)
    }

    /// Flat text: `content` if present, else spans joined with newlines.
    pub fn text(&self) -> Option<String> {
        if let Some(content) = &self.content {
            return Some(content.clone());
        }
        self.spans.as_ref().map(|spans| {
            spans
                .iter()
                .map(|span| span.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    /// Whether the text is produced by merging spans.
    pub fn has_spans(&self) -> bool {
        self.content.is_none() && self.spans.is_some()
    }

    /// Default id: `path`, or `path#symbol` when a symbol is present.
    pub fn default_id(path: &str, symbol: Option<&str>) -> String {
        match symbol {
            Some(symbol) if !symbol.is_empty() => format!("{path}#{symbol}"),
            _ => path.to_string(),
        }
    }

    /// Canonical within-section order:
    /// `(normalized_path, start_line or ∞, symbol or "", id)`.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.normalized_path()
            .cmp(&other.normalized_path())
            .then_with(|| {
                let a = self.start_line().unwrap_or(u64::MAX);
                let b = other.start_line().unwrap_or(u64::MAX);
                a.cmp(&b)
            })
            .then_with(|| {
                let a = self.symbol.as_deref().unwrap_or("");
                let b = other.symbol.as_deref().unwrap_or("");
                a.cmp(b)
            })
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this item (in `section`) is what `locator` points at.
    ///
    /// Matches on the content hash, or on section + path + start line. File
    /// locators match any item of that path.
    pub fn matches_locator(&self, section: SectionName, locator: &Locator) -> bool {
        if section != locator.section {
            return false;
        }
        if let Some(sha) = &self.sha256
            && !locator.sha256.is_empty()
            && sha.eq_ignore_ascii_case(&locator.sha256)
        {
            return true;
        }
        if self.normalized_path() != normalize_path(&locator.loc.path) {
            return false;
        }
        match locator.kind {
            LocatorKind::File => true,
            LocatorKind::Symbol | LocatorKind::Span => match self.start_line() {
                Some(line) => line == locator.loc.start_line,
                None => true,
            },
        }
    }
}

/// A named, ordered group of items.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub name: SectionName,
    pub items: Vec<Item>,
}

impl Section {
    pub fn empty(name: SectionName) -> Self {
        Self {
            name,
            items: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    File,
    Symbol,
    Span,
}

impl LocatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Symbol => "symbol",
            Self::Span => "span",
        }
    }
}

/// Where a record or locator came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    Diff,
    FailingTests,
    Labels,
    Imports,
    Templates,
    Migrations,
    Heuristic,
    Manual,
    Planner,
    Builder,
}

impl ProvenanceSource {
    pub const ALL: [Self; 10] = [
        Self::Diff,
        Self::FailingTests,
        Self::Labels,
        Self::Imports,
        Self::Templates,
        Self::Migrations,
        Self::Heuristic,
        Self::Manual,
        Self::Planner,
        Self::Builder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::FailingTests => "failing_tests",
            Self::Labels => "labels",
            Self::Imports => "imports",
            Self::Templates => "templates",
            Self::Migrations => "migrations",
            Self::Heuristic => "heuristic",
            Self::Manual => "manual",
            Self::Planner => "planner",
            Self::Builder => "builder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|src| src.as_str() == s)
    }
}

/// Reference into the candidate universe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Locator {
    pub kind: LocatorKind,
    pub section: SectionName,
    pub loc: Loc,
    pub sha256: String,
    pub source: ProvenanceSource,
}

impl Locator {
    /// Sort key used for deterministic locator lists.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.section
            .cmp(&other.section)
            .then_with(|| normalize_path(&self.loc.path).cmp(&normalize_path(&other.loc.path)))
            .then_with(|| self.loc.start_line.cmp(&other.loc.start_line))
            .then_with(|| self.kind.as_str().cmp(other.kind.as_str()))
            .then_with(|| self.sha256.cmp(&other.sha256))
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind.as_str(),
            self.section,
            self.loc.path,
            self.loc.start_line
        )
    }
}

/// Structured exclusion matching a path glob and, optionally, a line range
/// or symbol.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpanMatcher {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// A `never_include` rule: a path glob or a structured span matcher.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeverInclude {
    Glob(String),
    Span(SpanMatcher),
}

impl NeverInclude {
    /// Whether a bare path is excluded (span rules only exclude when they
    /// carry no line range or symbol).
    pub fn matches_path(&self, path: &str) -> bool {
        match self {
            Self::Glob(pattern) => glob_matches(pattern, path),
            Self::Span(m) => {
                m.start_line.is_none()
                    && m.end_line.is_none()
                    && m.symbol.is_none()
                    && glob_matches(&m.path, path)
            }
        }
    }

    pub fn matches_item(&self, item: &Item) -> bool {
        let Some(path) = item.effective_path() else {
            return false;
        };
        match self {
            Self::Glob(pattern) => glob_matches(pattern, path),
            Self::Span(m) => {
                if !glob_matches(&m.path, path) {
                    return false;
                }
                if let Some(symbol) = &m.symbol
                    && item.symbol.as_deref() != Some(symbol.as_str())
                {
                    return false;
                }
                if m.start_line.is_none() && m.end_line.is_none() {
                    return true;
                }
                // Whole-file items overlap every range.
                let Some(item_start) = item.start_line() else {
                    return true;
                };
                let item_end = item.end_line().unwrap_or(item_start);
                let rule_start = m.start_line.unwrap_or(1);
                let rule_end = m.end_line.unwrap_or(u64::MAX);
                item_start <= rule_end && rule_start <= item_end
            }
        }
    }
}

/// Append-only audit record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provenance {
    pub source: ProvenanceSource,
    pub generator: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A sealed pack.
///
/// Every field is required so that the typed form serializes back to the
/// exact document that was sealed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pack {
    pub version: String,
    pub project: Project,
    pub pr: PullRequest,
    pub mode: Mode,
    pub order: Vec<SectionName>,
    pub budgets: Budgets,
    pub sections: Vec<Section>,
    pub must_include: Vec<Locator>,
    pub nice_to_have: Vec<Locator>,
    pub never_include: Vec<NeverInclude>,
    pub provenance: Vec<Provenance>,
    pub hash: String,
}

impl Pack {
    /// Parse a pack from a JSON value (structure only; see `validate`).
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn section(&self, name: SectionName) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Total number of items across all sections.
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }
}

impl Sealable for Pack {
    fn declared_hash(&self) -> &str {
        &self.hash
    }

    fn set_hash(&mut self, hash: String) {
        self.hash = hash;
    }
}
