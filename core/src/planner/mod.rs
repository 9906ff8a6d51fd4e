//! Signal-driven planning: turns a diff, file contents, labels and failing
//! tests into candidate sections for a pack draft.
//!
//! The planner never reads the filesystem. Everything it can "see" is in
//! [`PlanInputs::file_contents`], and every output list is sorted so that
//! the same logical inputs always produce the same draft.

pub mod diff;
pub mod symbols;
pub mod templates;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::builder::{BudgetsDraft, ItemDraft, PackDraft, SectionDraft, build_pack};
use crate::canonical::canonicalize;
use crate::error::Result;
use crate::hash::{derived_timestamp, seal_hash_value, sha256_hex};
use crate::paths::{extension, file_name, file_stem, normalize_path, resolve_relative};
use crate::types::{
    Budgets, Item, Loc, Locator, LocatorKind, Mode, NeverInclude, Pack, Project, Provenance,
    ProvenanceSource, PullRequest, Section, SectionName,
};

use self::diff::{ChangeStatus, FileChange, parse_unified_diff};
use self::symbols::{Symbol, extract_symbols, relative_imports};
use self::templates::{TemplateOrigin, TemplateRef, TemplateRegistry, select_templates};

/// Symbols taken from each one-hop import neighbor.
pub const MAX_IMPORT_SYMBOLS: usize = 5;

/// Path of the placeholder injected when no tests could be linked.
pub const NO_TESTS_STUB: &str = "contracts/no-tests-found.stub";

const NO_TESTS_NOTE: &str = "No tests are linked to this change. \
Add or name the tests that cover it before relying on the result.";

const MIGRATION_EXTENSIONS: [&str; 3] = ["sql", "psql", "ddl"];

/// Extensions tried when resolving an extensionless relative import.
const IMPORT_EXTENSIONS: [&str; 6] = ["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Sections the max-files pass may shrink, in the order it shrinks them.
const MAX_FILES_DROP_ORDER: [SectionName; 4] = [
    SectionName::Extras,
    SectionName::LinkedTests,
    SectionName::Templates,
    SectionName::SpecCanvas,
];

/// Raw planning signals, already resolved into memory by the caller.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanInputs {
    pub project: Option<Project>,
    pub pr: Option<PullRequest>,
    pub mode: Option<Mode>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Unified diff text. When absent, every key of `file_contents` counts
    /// as touched.
    pub diff: Option<String>,
    #[serde(default)]
    pub file_contents: BTreeMap<String, String>,
    #[serde(default)]
    pub failing_tests: Vec<String>,
    /// Template registry keyed by label.
    #[serde(default)]
    pub templates: BTreeMap<String, Vec<TemplateRef>>,
    #[serde(default)]
    pub budgets: BudgetsDraft,
    #[serde(default)]
    pub never_include: Vec<NeverInclude>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    SectionCap,
    MaxFiles,
}

impl OmissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SectionCap => "section_cap",
            Self::MaxFiles => "max_files",
        }
    }
}

/// An optional candidate dropped while planning.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Omission {
    pub section: SectionName,
    pub id: String,
    pub reason: OmissionReason,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub order: Vec<SectionName>,
    pub budgets: Budgets,
    pub sections: Vec<Section>,
    pub must_include: Vec<Locator>,
    pub nice_to_have: Vec<Locator>,
    pub never_include: Vec<NeverInclude>,
    pub provenance: Vec<Provenance>,
    pub omissions: Vec<Omission>,
}

impl PlanOutput {
    /// Draft carrying the plan plus the identity fields from `inputs`.
    pub fn into_draft(self, inputs: &PlanInputs) -> PackDraft {
        PackDraft {
            version: None,
            project: inputs.project.clone(),
            pr: inputs.pr.clone(),
            mode: inputs.mode,
            order: Some(self.order),
            budgets: BudgetsDraft::from(self.budgets),
            sections: self
                .sections
                .into_iter()
                .map(|s| SectionDraft {
                    name: s.name,
                    items: s.items.into_iter().map(ItemDraft::from).collect(),
                })
                .collect(),
            must_include: self.must_include,
            nice_to_have: self.nice_to_have,
            never_include: self.never_include,
            provenance: self.provenance,
            hash: None,
        }
    }
}

/// Plan with the registry carried in the inputs (if any).
pub fn plan_from_signals(inputs: &PlanInputs) -> Result<PlanOutput> {
    let registry: Option<&dyn TemplateRegistry> = if inputs.templates.is_empty() {
        None
    } else {
        Some(&inputs.templates)
    };
    plan_with_registry(inputs, registry)
}

/// Plan, build and seal in one step. Omissions are returned alongside.
pub fn plan_pack(inputs: &PlanInputs) -> Result<(Pack, Vec<Omission>)> {
    let plan = plan_from_signals(inputs)?;
    let omissions = plan.omissions.clone();
    let pack = build_pack(plan.into_draft(inputs))?;
    Ok((pack, omissions))
}

pub fn plan_with_registry(
    inputs: &PlanInputs,
    registry: Option<&dyn TemplateRegistry>,
) -> Result<PlanOutput> {
    let files: BTreeMap<String, &str> = inputs
        .file_contents
        .iter()
        .map(|(path, content)| (normalize_path(path), content.as_str()))
        .collect();
    let changes = touched_files(inputs, &files);
    let created_at = derived_timestamp(&input_digest(inputs, &changes)?);

    let mut planner = Planner {
        files: &files,
        never_include: &inputs.never_include,
        created_at,
        sections: BTreeMap::new(),
        must_include: Vec::new(),
        nice_to_have: Vec::new(),
        provenance: Vec::new(),
    };

    planner.add_changes(&changes);
    planner.add_import_neighbors(&changes);
    planner.add_linked_tests(&changes, &inputs.failing_tests);
    planner.add_templates(&inputs.labels, registry);

    let budgets = inputs.budgets.resolve();
    let omissions = planner.apply_caps(&budgets);
    let output = planner.finish(budgets, &inputs.never_include, omissions)?;

    info!(
        touched = changes.len(),
        items = output.sections.iter().map(|s| s.items.len()).sum::<usize>(),
        must_include = output.must_include.len(),
        omissions = output.omissions.len(),
        "planned pack"
    );
    Ok(output)
}

/// Whether a path is treated as a schema migration.
pub fn is_migration(path: &str) -> bool {
    let path = normalize_path(path);
    path.starts_with("migrations/")
        || path.contains("/migrations/")
        || extension(&path).is_some_and(|ext| MIGRATION_EXTENSIONS.contains(&ext.as_str()))
}

fn is_test_path(path: &str) -> bool {
    path.starts_with("tests/") || path.contains("/tests/") || file_name(path).contains(".test.")
}

fn touched_files(inputs: &PlanInputs, files: &BTreeMap<String, &str>) -> Vec<FileChange> {
    let mut by_path: BTreeMap<String, FileChange> = BTreeMap::new();
    match inputs.diff.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(diff) => {
            for change in parse_unified_diff(diff) {
                by_path.insert(change.path.clone(), change);
            }
        }
        None => {
            for path in files.keys() {
                by_path.insert(
                    path.clone(),
                    FileChange {
                        path: path.clone(),
                        renamed_from: None,
                        status: ChangeStatus::Modified,
                    },
                );
            }
        }
    }
    by_path.into_values().collect()
}

/// Digest of the order-insensitive view of the inputs.
fn input_digest(inputs: &PlanInputs, changes: &[FileChange]) -> Result<String> {
    let mut labels = inputs.labels.clone();
    labels.sort();
    labels.dedup();
    let mut failing: Vec<String> = inputs.failing_tests.iter().map(|p| normalize_path(p)).collect();
    failing.sort();
    failing.dedup();
    let mut never = inputs
        .never_include
        .iter()
        .map(canonicalize)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    never.sort();

    let view = json!({
        "project": inputs.project,
        "pr": inputs.pr,
        "mode": inputs.mode,
        "labels": labels,
        "changes": changes,
        "file_contents": inputs.file_contents,
        "failing_tests": failing,
        "templates": inputs.templates,
        "budgets": inputs.budgets,
        "never_include": never,
    });
    Ok(seal_hash_value(&view)?)
}

struct Planner<'a> {
    files: &'a BTreeMap<String, &'a str>,
    never_include: &'a [NeverInclude],
    created_at: String,
    sections: BTreeMap<SectionName, Vec<Item>>,
    must_include: Vec<Locator>,
    nice_to_have: Vec<Locator>,
    provenance: Vec<Provenance>,
}

impl<'a> Planner<'a> {
    fn excluded(&self, path: &str) -> bool {
        let hit = self.never_include.iter().any(|rule| rule.matches_path(path));
        if hit {
            debug!(path, "skipped by never_include");
        }
        hit
    }

    fn record(&mut self, source: ProvenanceSource, reason: impl Into<String>) {
        self.provenance.push(Provenance {
            source,
            generator: format!("ctxpack-planner/{}", crate::VERSION),
            created_at: self.created_at.clone(),
            reason: Some(reason.into()),
        });
    }

    fn content(&self, path: &str) -> Option<&'a str> {
        self.files.get(path).copied()
    }

    /// Add an item, keeping ids unique within the section.
    fn push(&mut self, section: SectionName, mut item: Item) -> Item {
        let items = self.sections.entry(section).or_default();
        if items.iter().any(|i| i.id == item.id) {
            item.id = format!("{}@{}", item.id, item.start_line().unwrap_or(0));
        }
        items.push(item.clone());
        item
    }

    fn locator(
        item: &Item,
        kind: LocatorKind,
        section: SectionName,
        source: ProvenanceSource,
    ) -> Locator {
        let path = item.effective_path().unwrap_or_default().to_string();
        Locator {
            kind,
            section,
            loc: Loc {
                path: path.clone(),
                start_line: item.start_line().unwrap_or(1),
                end_line: item.end_line(),
            },
            sha256: item.sha256.clone().unwrap_or_else(|| sha256_hex(&path)),
            source,
        }
    }

    fn add_changes(&mut self, changes: &[FileChange]) {
        for change in changes {
            if let Some(from) = &change.renamed_from {
                self.record(ProvenanceSource::Diff, format!("rename {from} -> {}", change.path));
            }
            if self.excluded(&change.path) {
                continue;
            }
            let content = match change.status {
                ChangeStatus::Deleted => None,
                _ => self.content(&change.path),
            };

            if is_migration(&change.path) {
                let item = self.push(SectionName::Contracts, whole_file(&change.path, content, 0));
                self.must_include.push(Self::locator(
                    &item,
                    LocatorKind::File,
                    SectionName::Contracts,
                    ProvenanceSource::Migrations,
                ));
                self.record(ProvenanceSource::Migrations, format!("migration: {}", change.path));
                continue;
            }

            let symbols = content.map(extract_symbols).unwrap_or_default();
            if symbols.is_empty() {
                let item = self.push(SectionName::DiffSlices, whole_file(&change.path, content, 0));
                self.nice_to_have.push(Self::locator(
                    &item,
                    LocatorKind::File,
                    SectionName::DiffSlices,
                    ProvenanceSource::Diff,
                ));
                continue;
            }
            for symbol in &symbols {
                let item = self.push(
                    SectionName::DiffSlices,
                    symbol_item(&change.path, content.unwrap_or_default(), symbol, 0),
                );
                self.nice_to_have.push(Self::locator(
                    &item,
                    LocatorKind::Symbol,
                    SectionName::DiffSlices,
                    ProvenanceSource::Diff,
                ));
            }
        }
    }

    fn resolve_import(&self, from: &str, spec: &str) -> Option<String> {
        let base = resolve_relative(from, spec)?;
        let mut candidates = vec![base.clone()];
        candidates.extend(IMPORT_EXTENSIONS.iter().map(|ext| format!("{base}.{ext}")));
        candidates.extend(IMPORT_EXTENSIONS.iter().map(|ext| format!("{base}/index.{ext}")));
        candidates.into_iter().find(|c| self.files.contains_key(c))
    }

    fn add_import_neighbors(&mut self, changes: &[FileChange]) {
        let touched: BTreeSet<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        let mut neighbors: BTreeMap<String, String> = BTreeMap::new();

        for change in changes {
            if change.status == ChangeStatus::Deleted
                || is_migration(&change.path)
                || self.excluded(&change.path)
            {
                continue;
            }
            let Some(content) = self.content(&change.path) else {
                continue;
            };
            for spec in relative_imports(content) {
                if let Some(target) = self.resolve_import(&change.path, &spec)
                    && !touched.contains(target.as_str())
                {
                    neighbors.entry(target).or_insert_with(|| change.path.clone());
                }
            }
        }

        for (target, importer) in neighbors {
            if self.excluded(&target) {
                continue;
            }
            let content = self.content(&target);
            let symbols = content.map(extract_symbols).unwrap_or_default();
            if symbols.is_empty() {
                self.push(SectionName::Extras, whole_file(&target, content, 1));
            } else {
                for symbol in symbols.iter().take(MAX_IMPORT_SYMBOLS) {
                    self.push(
                        SectionName::Extras,
                        symbol_item(&target, content.unwrap_or_default(), symbol, 1),
                    );
                }
            }
            self.record(ProvenanceSource::Imports, format!("import {importer} -> {target}"));
        }
    }

    fn add_linked_tests(&mut self, changes: &[FileChange], failing_tests: &[String]) {
        let mut linked: BTreeMap<String, ProvenanceSource> = BTreeMap::new();
        if failing_tests.is_empty() {
            for change in changes {
                if is_migration(&change.path) || is_test_path(&change.path) {
                    continue;
                }
                let prefix = format!("{}.test.", file_stem(&change.path));
                for path in self.files.keys() {
                    let Some(rest) = path.strip_prefix("tests/") else {
                        continue;
                    };
                    if !rest.contains('/') && rest.starts_with(&prefix) {
                        linked.insert(path.clone(), ProvenanceSource::Heuristic);
                    }
                }
            }
        } else {
            for path in failing_tests {
                linked.insert(normalize_path(path), ProvenanceSource::FailingTests);
            }
        }

        let mut any = false;
        for (path, source) in linked {
            if self.excluded(&path) {
                continue;
            }
            let distance = if source == ProvenanceSource::FailingTests { 0 } else { 1 };
            let item = self.push(
                SectionName::LinkedTests,
                whole_file(&path, self.content(&path), distance),
            );
            if source == ProvenanceSource::FailingTests {
                self.nice_to_have.push(Self::locator(
                    &item,
                    LocatorKind::File,
                    SectionName::LinkedTests,
                    source,
                ));
            }
            any = true;
        }

        if !any {
            self.push(
                SectionName::Contracts,
                whole_file(NO_TESTS_STUB, Some(NO_TESTS_NOTE), 0),
            );
            self.record(ProvenanceSource::Heuristic, "no_tests_found");
        }
    }

    fn add_templates(&mut self, labels: &[String], registry: Option<&dyn TemplateRegistry>) {
        for (template, origin) in select_templates(labels, registry) {
            if self.excluded(&template.path) {
                continue;
            }
            let path = normalize_path(&template.path);
            let content = template.content.as_deref().or_else(|| self.content(&path));
            self.push(SectionName::Templates, whole_file(&path, content, 0));
            let source = match origin {
                TemplateOrigin::Registry => ProvenanceSource::Templates,
                TemplateOrigin::Builtin => ProvenanceSource::Labels,
            };
            self.record(source, format!("template: {path}"));
        }
    }

    /// Section caps first (diff slices and contracts exempt), then the
    /// global file cap, which only shrinks the optional sections.
    fn apply_caps(&mut self, budgets: &Budgets) -> Vec<Omission> {
        let mut omissions = Vec::new();
        for items in self.sections.values_mut() {
            items.sort_by(Item::canonical_cmp);
        }

        for name in SectionName::ALL {
            if matches!(name, SectionName::DiffSlices | SectionName::Contracts) {
                continue;
            }
            let cap = usize::try_from(budgets.section_caps.get(name)).unwrap_or(usize::MAX);
            let Some(items) = self.sections.get_mut(&name) else {
                continue;
            };
            if items.len() > cap {
                for dropped in items.drain(cap..) {
                    omissions.push(Omission {
                        section: name,
                        id: dropped.id,
                        reason: OmissionReason::SectionCap,
                    });
                }
            }
        }

        if budgets.max_files > 0 {
            let max_files = usize::try_from(budgets.max_files).unwrap_or(usize::MAX);
            let mut total: usize = self.sections.values().map(Vec::len).sum();
            while total > max_files {
                let Some((name, dropped)) = MAX_FILES_DROP_ORDER.iter().find_map(|name| {
                    self.sections
                        .get_mut(name)
                        .and_then(Vec::pop)
                        .map(|item| (*name, item))
                }) else {
                    break;
                };
                omissions.push(Omission {
                    section: name,
                    id: dropped.id,
                    reason: OmissionReason::MaxFiles,
                });
                total -= 1;
            }
        }

        omissions
    }

    fn finish(
        self,
        budgets: Budgets,
        never_include: &[NeverInclude],
        mut omissions: Vec<Omission>,
    ) -> Result<PlanOutput> {
        let Planner {
            sections: mut by_name,
            mut must_include,
            nice_to_have,
            mut provenance,
            ..
        } = self;

        let sections: Vec<Section> = SectionName::ALL
            .into_iter()
            .map(|name| {
                let mut items = by_name.remove(&name).unwrap_or_default();
                items.sort_by(Item::canonical_cmp);
                Section { name, items }
            })
            .collect();

        // Preferences for dropped items are meaningless.
        let mut nice_to_have: Vec<Locator> = nice_to_have
            .into_iter()
            .filter(|locator| {
                sections.iter().any(|s| {
                    s.items
                        .iter()
                        .any(|item| item.matches_locator(s.name, locator))
                })
            })
            .collect();

        must_include.sort_by(Locator::canonical_cmp);
        must_include.dedup();
        nice_to_have.sort_by(Locator::canonical_cmp);
        nice_to_have.dedup();
        provenance.sort_by(|a, b| a.source.cmp(&b.source).then_with(|| a.reason.cmp(&b.reason)));
        provenance.dedup();
        omissions.sort_by(|a, b| a.section.cmp(&b.section).then_with(|| a.id.cmp(&b.id)));

        let mut keyed = never_include
            .iter()
            .map(|rule| canonicalize(rule).map(|key| (key, rule.clone())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);

        Ok(PlanOutput {
            order: SectionName::ALL.to_vec(),
            budgets,
            sections,
            must_include,
            nice_to_have,
            never_include: keyed.into_iter().map(|(_, rule)| rule).collect(),
            provenance,
            omissions,
        })
    }
}

fn whole_file(path: &str, content: Option<&str>, distance: u64) -> Item {
    Item {
        id: path.to_string(),
        path: Some(path.to_string()),
        content: content.map(str::to_string),
        sha256: content.map(sha256_hex),
        distance_to_diff: Some(distance),
        ..Default::default()
    }
}

fn symbol_item(path: &str, content: &str, symbol: &Symbol, distance: u64) -> Item {
    let text = symbol.slice(content);
    Item {
        id: Item::default_id(path, Some(&symbol.name)),
        path: Some(path.to_string()),
        sha256: Some(sha256_hex(&text)),
        content: Some(text),
        symbol: Some(symbol.name.clone()),
        loc: Some(Loc {
            path: path.to_string(),
            start_line: symbol.start_line,
            end_line: Some(symbol.end_line),
        }),
        distance_to_diff: Some(distance),
        ..Default::default()
    }
}
