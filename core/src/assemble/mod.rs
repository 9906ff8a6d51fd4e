//! Budget-constrained, deterministic assembly of a sealed pack into a
//! manifest.
//!
//! Assembly runs in two phases over one canonical traversal of the
//! candidates:
//!
//! 1. Prepare: drop `never_include` matches, sort each section canonically,
//!    merge spans, estimate tokens and compress to the per-file cap, then
//!    classify duplicates by content hash (the first occurrence in
//!    traversal order is the primary).
//! 2. Place: charge required primaries first, then rank each section's
//!    optional primaries and fill in ranked order until the first candidate
//!    that does not fit. Duplicates of placed primaries become zero-token
//!    pointers.
//!
//! Ranking before filling means the kept set depends only on the candidate
//! list, never on the order it was presented in.

pub mod compress;
pub mod tokens;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PackError, Result};
use crate::hash::{seal, sha256_hex, verify, verify_value};
use crate::manifest::{
    Eviction, EvictionReason, ItemRef, Manifest, ManifestItem, ManifestSection, Metrics,
    PointerRecord, Totals,
};
use crate::paths::normalize_path;
use crate::types::{Budgets, Item, Pack, SectionName};
use crate::validate::{ValidateOptions, validate, validate_pack};

pub use compress::{ELISION_MARKER, Fitted, fit_to_cap};
pub use tokens::{CharRatioEstimator, EstimatorKind, TokenEstimator, WhitespaceEstimator};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssembleOptions {
    /// Model identifier recorded in the manifest.
    pub model: String,
    pub estimator: EstimatorKind,
    /// Per-section token ceilings. Absent or 0 means unlimited.
    #[serde(default)]
    pub section_token_caps: BTreeMap<SectionName, u64>,
    #[serde(default)]
    pub allow_minor_version: bool,
}

impl AssembleOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Assembly always validates with strict ordering.
    pub fn validate_options(&self) -> ValidateOptions {
        ValidateOptions {
            strict_order: true,
            allow_minor_version: self.allow_minor_version,
        }
    }
}

/// Assemble a raw sealed document.
///
/// The seal is checked against the document as written, before it is
/// parsed into a [`Pack`].
pub fn assemble_value(value: &Value, opts: &AssembleOptions) -> Result<Manifest> {
    validate(value, &opts.validate_options())?;
    verify_value(value)?;
    assemble(&Pack::from_value(value.clone())?, opts)
}

/// Assemble with the estimator selected in `opts`.
pub fn assemble(pack: &Pack, opts: &AssembleOptions) -> Result<Manifest> {
    let estimator = opts.estimator.build();
    assemble_with(pack, opts, estimator.as_ref())
}

/// Assemble with a caller-supplied estimator.
pub fn assemble_with(
    pack: &Pack,
    opts: &AssembleOptions,
    estimator: &dyn TokenEstimator,
) -> Result<Manifest> {
    validate_pack(pack, &opts.validate_options())?;
    verify(pack)?;

    let selected: BTreeSet<SectionName> = pack.order.iter().copied().collect();
    let (mut candidates, merged_spans) = prepare(pack, &selected, estimator);
    let dup_of = classify_duplicates(&mut candidates);

    let mut budget = Budget::new(&pack.budgets, &opts.section_token_caps);
    place_required(&mut candidates, &dup_of, &mut budget);
    for name in SectionName::ALL {
        fill_section(name, &mut candidates, &dup_of, &mut budget);
    }
    resolve_duplicates(&mut candidates, &dup_of);

    check_must_include(pack, &candidates)?;

    let manifest = build_manifest(pack, opts, &selected, &candidates, &budget, merged_spans);
    let manifest = seal(manifest)?;
    info!(
        model = %manifest.model,
        estimator = estimator.name(),
        tokens = manifest.totals.tokens,
        files = manifest.totals.files,
        deduped = manifest.metrics.deduped,
        evictions = manifest.evictions.len(),
        hash = %manifest.hash,
        "assembled manifest"
    );
    Ok(manifest)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Pending,
    Placed,
    /// Zero-token reference to the placed primary at this index.
    Pointer(usize),
    Evicted(EvictionReason),
}

struct Candidate<'a> {
    section: SectionName,
    item: &'a Item,
    /// Text after span merging and compression.
    text: Option<String>,
    tokens: u64,
    /// Char length before compression.
    length: usize,
    key: Option<String>,
    required: bool,
    preferred: bool,
    slot: Slot,
}

fn prepare<'a>(
    pack: &'a Pack,
    selected: &BTreeSet<SectionName>,
    estimator: &dyn TokenEstimator,
) -> (Vec<Candidate<'a>>, u64) {
    let mut out = Vec::new();
    let mut merged_spans = 0;

    for name in SectionName::ALL {
        if !selected.contains(&name) {
            continue;
        }
        let Some(section) = pack.section(name) else {
            continue;
        };

        let mut items: Vec<&Item> = section
            .items
            .iter()
            .filter(|item| {
                let excluded = pack.never_include.iter().any(|rule| rule.matches_item(item));
                if excluded {
                    debug!(section = %name, id = %item.id, "dropped by never_include");
                }
                !excluded
            })
            .collect();
        items.sort_by(|a, b| a.canonical_cmp(b));

        for item in items {
            if item.has_spans() {
                merged_spans += 1;
            }
            let raw = item.text();
            let key = match &raw {
                Some(text) => Some(sha256_hex(text)),
                None => item.sha256.as_ref().map(|sha| sha.to_ascii_lowercase()),
            };
            let length = raw.as_ref().map_or(0, |text| text.chars().count());

            let (text, tokens, slot) = match raw {
                None => (None, 0, Slot::Pending),
                Some(raw) => match fit_to_cap(&raw, pack.budgets.max_per_file_tokens, estimator) {
                    Some(fitted) => {
                        if fitted.compressed {
                            debug!(
                                section = %name,
                                id = %item.id,
                                tokens = fitted.tokens,
                                "compressed"
                            );
                        }
                        (Some(fitted.text), fitted.tokens, Slot::Pending)
                    }
                    None => (
                        None,
                        estimator.estimate(&raw),
                        Slot::Evicted(EvictionReason::PerFileCap),
                    ),
                },
            };

            out.push(Candidate {
                section: name,
                item,
                text,
                tokens,
                length,
                key,
                required: pack
                    .must_include
                    .iter()
                    .any(|locator| item.matches_locator(name, locator)),
                preferred: pack
                    .nice_to_have
                    .iter()
                    .any(|locator| item.matches_locator(name, locator)),
                slot,
            });
        }
    }

    (out, merged_spans)
}

/// Map each duplicate to its primary. Required and preferred marks move
/// to the primary, since the duplicate is only ever a pointer to it.
fn classify_duplicates(candidates: &mut [Candidate<'_>]) -> Vec<Option<usize>> {
    let mut first: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dup_of = vec![None; candidates.len()];
    for (i, candidate) in candidates.iter().enumerate() {
        let Some(key) = candidate.key.as_deref() else {
            continue;
        };
        match first.get(key) {
            Some(&primary) => dup_of[i] = Some(primary),
            None => {
                first.insert(key, i);
            }
        }
    }

    for (i, primary) in dup_of.iter().enumerate() {
        if let Some(p) = *primary {
            let (required, preferred) = (candidates[i].required, candidates[i].preferred);
            candidates[p].required |= required;
            candidates[p].preferred |= preferred;
        }
    }
    dup_of
}

struct Budget<'b> {
    budgets: &'b Budgets,
    token_caps: &'b BTreeMap<SectionName, u64>,
    tokens: u64,
    files: u64,
    per_section: BTreeMap<SectionName, Totals>,
}

impl<'b> Budget<'b> {
    fn new(budgets: &'b Budgets, token_caps: &'b BTreeMap<SectionName, u64>) -> Self {
        Self {
            budgets,
            token_caps,
            tokens: 0,
            files: 0,
            per_section: BTreeMap::new(),
        }
    }

    fn check(&self, section: SectionName, tokens: u64) -> std::result::Result<(), EvictionReason> {
        let used = self.per_section.get(&section).copied().unwrap_or_default();
        if used.files + 1 > self.budgets.section_caps.get(section) {
            return Err(EvictionReason::SectionCap);
        }
        let token_cap = self.token_caps.get(&section).copied().unwrap_or(0);
        if token_cap > 0 && used.tokens + tokens > token_cap {
            return Err(EvictionReason::SectionTokenCap);
        }
        if self.budgets.max_files > 0 && self.files + 1 > self.budgets.max_files {
            return Err(EvictionReason::MaxFiles);
        }
        if self.budgets.max_tokens > 0 && self.tokens + tokens > self.budgets.max_tokens {
            return Err(EvictionReason::MaxTokens);
        }
        Ok(())
    }

    fn charge(&mut self, section: SectionName, tokens: u64) {
        let used = self.per_section.entry(section).or_default();
        used.files += 1;
        used.tokens += tokens;
        self.files += 1;
        self.tokens += tokens;
    }
}

fn try_place(candidate: &mut Candidate<'_>, budget: &mut Budget<'_>) -> Option<EvictionReason> {
    match budget.check(candidate.section, candidate.tokens) {
        Ok(()) => {
            budget.charge(candidate.section, candidate.tokens);
            candidate.slot = Slot::Placed;
            debug!(
                section = %candidate.section,
                id = %candidate.item.id,
                tokens = candidate.tokens,
                required = candidate.required,
                "placed"
            );
            None
        }
        Err(reason) => {
            candidate.slot = Slot::Evicted(reason);
            debug!(
                section = %candidate.section,
                id = %candidate.item.id,
                reason = reason.as_str(),
                "evicted"
            );
            Some(reason)
        }
    }
}

fn place_required(
    candidates: &mut [Candidate<'_>],
    dup_of: &[Option<usize>],
    budget: &mut Budget<'_>,
) {
    for (candidate, dup) in candidates.iter_mut().zip(dup_of) {
        if dup.is_none() && candidate.required && candidate.slot == Slot::Pending {
            try_place(candidate, budget);
        }
    }
}

/// Optional candidates: nice-to-have first, then closer to the diff, then
/// shorter, then canonical position.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.preferred
        .cmp(&a.preferred)
        .then_with(|| {
            let da = a.item.distance_to_diff.unwrap_or(u64::MAX);
            let db = b.item.distance_to_diff.unwrap_or(u64::MAX);
            da.cmp(&db)
        })
        .then_with(|| a.length.cmp(&b.length))
}

fn fill_section(
    name: SectionName,
    candidates: &mut [Candidate<'_>],
    dup_of: &[Option<usize>],
    budget: &mut Budget<'_>,
) {
    let mut ranked: Vec<usize> = (0..candidates.len())
        .filter(|&i| {
            candidates[i].section == name
                && dup_of[i].is_none()
                && candidates[i].slot == Slot::Pending
        })
        .collect();
    ranked.sort_by(|&a, &b| rank(&candidates[a], &candidates[b]).then(a.cmp(&b)));

    let mut frontier = None;
    for i in ranked {
        match frontier {
            Some(reason) => candidates[i].slot = Slot::Evicted(reason),
            None => frontier = try_place(&mut candidates[i], budget),
        }
    }
}

fn resolve_duplicates(candidates: &mut [Candidate<'_>], dup_of: &[Option<usize>]) {
    for (i, dup) in dup_of.iter().enumerate() {
        let Some(primary) = *dup else {
            continue;
        };
        candidates[i].slot = if candidates[primary].slot == Slot::Placed {
            Slot::Pointer(primary)
        } else {
            Slot::Evicted(EvictionReason::DuplicateOfEvicted)
        };
    }
}

/// A locator is satisfied by a placed item or by a pointer to one, since the
/// referent's content is in the manifest either way.
fn check_must_include(pack: &Pack, candidates: &[Candidate<'_>]) -> Result<()> {
    for locator in &pack.must_include {
        let matching: Vec<&Candidate<'_>> = candidates
            .iter()
            .filter(|c| c.item.matches_locator(c.section, locator))
            .collect();
        let satisfied = matching
            .iter()
            .any(|c| matches!(c.slot, Slot::Placed | Slot::Pointer(_)));
        if satisfied {
            continue;
        }
        let reason = matching
            .iter()
            .find_map(|c| match c.slot {
                Slot::Evicted(reason) => Some(format!("evicted ({})", reason.as_str())),
                _ => None,
            })
            .unwrap_or_else(|| "no candidate matches the locator".to_string());
        tracing::warn!(locator = %locator, %reason, "required content cannot be placed");
        return Err(PackError::budget(locator.to_string(), reason));
    }
    Ok(())
}

fn build_manifest(
    pack: &Pack,
    opts: &AssembleOptions,
    selected: &BTreeSet<SectionName>,
    candidates: &[Candidate<'_>],
    budget: &Budget<'_>,
    merged_spans: u64,
) -> Manifest {
    let mut sections = Vec::new();
    let mut per_section = BTreeMap::new();
    let mut pointers = Vec::new();
    let mut evictions = Vec::new();

    for name in SectionName::ALL {
        if !selected.contains(&name) || pack.section(name).is_none() {
            continue;
        }
        let mut items = Vec::new();
        for c in candidates.iter().filter(|c| c.section == name) {
            let path = c.item.effective_path().map(normalize_path);
            match c.slot {
                Slot::Placed => items.push(ManifestItem {
                    id: c.item.id.clone(),
                    path,
                    tokens: c.tokens,
                    text: c.text.clone(),
                    pointer: None,
                    reference: None,
                }),
                Slot::Pointer(primary) => {
                    let target = &candidates[primary];
                    items.push(ManifestItem {
                        id: c.item.id.clone(),
                        path,
                        tokens: 0,
                        text: None,
                        pointer: Some(true),
                        reference: Some(ItemRef {
                            section: target.section,
                            id: target.item.id.clone(),
                        }),
                    });
                    pointers.push(PointerRecord {
                        from_id: c.item.id.clone(),
                        to_id: target.item.id.clone(),
                    });
                }
                Slot::Evicted(reason) => evictions.push(Eviction {
                    section: name,
                    id: c.item.id.clone(),
                    reason,
                }),
                Slot::Pending => {}
            }
        }
        per_section.insert(
            name,
            budget.per_section.get(&name).copied().unwrap_or_default(),
        );
        sections.push(ManifestSection { name, items });
    }

    Manifest {
        version: pack.version.clone(),
        model: opts.model.clone(),
        sections,
        totals: Totals {
            tokens: budget.tokens,
            files: budget.files,
        },
        metrics: Metrics {
            per_section,
            deduped: pointers.len() as u64,
            merged_spans,
        },
        pointers,
        evictions,
        hash: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{PackDraft, build_pack};
    use crate::types::{Loc, Locator, LocatorKind, ProvenanceSource, SectionCaps};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pack(draft: serde_json::Value) -> Pack {
        let draft: PackDraft = serde_json::from_value(draft).unwrap();
        build_pack(draft).unwrap()
    }

    fn cand(item: &Item, length: usize) -> Candidate<'_> {
        Candidate {
            section: SectionName::Templates,
            item,
            text: None,
            tokens: 0,
            length,
            key: None,
            required: false,
            preferred: false,
            slot: Slot::Pending,
        }
    }

    #[test]
    fn rank_prefers_near_then_short() {
        let far = Item {
            id: "far".into(),
            distance_to_diff: Some(100),
            ..Default::default()
        };
        let near = Item {
            id: "near".into(),
            distance_to_diff: Some(1),
            ..Default::default()
        };
        let a = cand(&far, 1);
        let b = cand(&near, 50);
        let c = cand(&near, 10);
        assert_eq!(rank(&a, &b), Ordering::Greater);
        assert_eq!(rank(&c, &b), Ordering::Less);
    }

    #[test]
    fn budget_checks_section_cap_before_globals() {
        let budgets = Budgets {
            max_tokens: 10,
            max_files: 1,
            max_per_file_tokens: 0,
            section_caps: SectionCaps {
                templates: 0,
                spec_canvas: 1,
                diff_slices: 1,
                linked_tests: 1,
                contracts: 1,
                extras: 1,
            },
        };
        let caps = BTreeMap::from([(SectionName::Extras, 3)]);
        let mut budget = Budget::new(&budgets, &caps);
        assert_eq!(budget.check(SectionName::Templates, 1), Err(EvictionReason::SectionCap));
        assert_eq!(budget.check(SectionName::Extras, 4), Err(EvictionReason::SectionTokenCap));
        assert_eq!(budget.check(SectionName::DiffSlices, 11), Err(EvictionReason::MaxTokens));
        budget.charge(SectionName::DiffSlices, 2);
        assert_eq!(budget.check(SectionName::Contracts, 1), Err(EvictionReason::MaxFiles));
    }

    #[test]
    fn content_less_items_cost_a_file_but_no_tokens() {
        let p = pack(json!({
            "sections": [{"name": "contracts", "items": [{"path": "db/migrations/001.sql"}]}]
        }));
        let m = assemble(&p, &AssembleOptions::new("m")).unwrap();
        assert_eq!(m.totals.tokens, 0);
        assert_eq!(m.totals.files, 1);
    }

    #[test]
    fn sections_outside_order_are_skipped() {
        let p = pack(json!({
            "order": ["templates"],
            "sections": [
                {"name": "templates", "items": [{"path": "t.md", "content": "t"}]},
                {"name": "extras", "items": [{"path": "e.md", "content": "e"}]}
            ]
        }));
        let m = assemble(&p, &AssembleOptions::new("m")).unwrap();
        assert_eq!(m.item_ids(), vec!["t.md"]);
        assert_eq!(m.sections.len(), 1);
    }

    #[test]
    fn nice_to_have_outranks_distance() {
        let mut p = pack(json!({
            "budgets": {"section_caps": {"extras": 1}},
            "sections": [{"name": "extras", "items": [
                {"path": "a.ts", "content": "aaaa", "distance_to_diff": 1},
                {"path": "b.ts", "content": "bbbb", "distance_to_diff": 5}
            ]}]
        }));
        p.nice_to_have.push(Locator {
            kind: LocatorKind::File,
            section: SectionName::Extras,
            loc: Loc {
                path: "b.ts".into(),
                start_line: 1,
                end_line: None,
            },
            sha256: sha256_hex("b.ts"),
            source: ProvenanceSource::Manual,
        });
        let p = seal(p).unwrap();
        let m = assemble(&p, &AssembleOptions::new("m")).unwrap();
        assert_eq!(m.item_ids(), vec!["b.ts"]);
        assert_eq!(m.evictions[0].id, "a.ts");
        assert_eq!(m.evictions[0].reason, EvictionReason::SectionCap);
    }

    #[test]
    fn section_token_cap_stops_the_section() {
        let p = pack(json!({
            "sections": [{"name": "extras", "items": [
                {"path": "a", "content": "x".repeat(40)},
                {"path": "b", "content": "x".repeat(41)}
            ]}]
        }));
        let mut opts = AssembleOptions::new("m");
        opts.section_token_caps.insert(SectionName::Extras, 15);
        let m = assemble(&p, &opts).unwrap();
        assert_eq!(m.item_ids(), vec!["a"]);
        assert_eq!(m.evictions[0].reason, EvictionReason::SectionTokenCap);
    }
}
