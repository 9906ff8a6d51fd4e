//! Draft defaulting and sealing.
//!
//! A draft is any hand-written or generated pack-shaped document where
//! everything except section contents is optional. The builder fills the
//! gaps, normalizes sections to the six canonical names, and seals the
//! result last so the hash covers every defaulted field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorCode, PackError, Result, ValidationErrors, Violation};
use crate::hash::{derived_timestamp, seal, seal_hash, sha256_hex};
use crate::types::{
    Budgets, Item, Loc, Locator, Mode, NeverInclude, PACK_VERSION, Pack, Project, Provenance,
    ProvenanceSource, PullRequest, Section, SectionCaps, SectionName, Span,
};

pub const DEFAULT_MAX_TOKENS: u64 = 20_000;
pub const DEFAULT_MAX_FILES: u64 = 200;
pub const DEFAULT_MAX_PER_FILE_TOKENS: u64 = 8_000;

pub const DEFAULT_SECTION_CAPS: SectionCaps = SectionCaps {
    templates: 10,
    spec_canvas: 5,
    diff_slices: 100,
    linked_tests: 40,
    contracts: 20,
    extras: 25,
};

/// Placeholder identity for drafts that carry none.
const LOCAL_ID: &str = "local";
const LOCAL_COMMIT: &str = "0000000";

pub fn default_budgets() -> Budgets {
    Budgets {
        max_tokens: DEFAULT_MAX_TOKENS,
        max_files: DEFAULT_MAX_FILES,
        max_per_file_tokens: DEFAULT_MAX_PER_FILE_TOKENS,
        section_caps: DEFAULT_SECTION_CAPS,
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionCapsDraft {
    pub templates: Option<u64>,
    pub spec_canvas: Option<u64>,
    pub diff_slices: Option<u64>,
    pub linked_tests: Option<u64>,
    pub contracts: Option<u64>,
    pub extras: Option<u64>,
}

impl SectionCapsDraft {
    pub fn set(&mut self, name: SectionName, cap: u64) {
        let slot = match name {
            SectionName::Templates => &mut self.templates,
            SectionName::SpecCanvas => &mut self.spec_canvas,
            SectionName::DiffSlices => &mut self.diff_slices,
            SectionName::LinkedTests => &mut self.linked_tests,
            SectionName::Contracts => &mut self.contracts,
            SectionName::Extras => &mut self.extras,
        };
        *slot = Some(cap);
    }

    fn resolve(&self) -> SectionCaps {
        let d = DEFAULT_SECTION_CAPS;
        SectionCaps {
            templates: self.templates.unwrap_or(d.templates),
            spec_canvas: self.spec_canvas.unwrap_or(d.spec_canvas),
            diff_slices: self.diff_slices.unwrap_or(d.diff_slices),
            linked_tests: self.linked_tests.unwrap_or(d.linked_tests),
            contracts: self.contracts.unwrap_or(d.contracts),
            extras: self.extras.unwrap_or(d.extras),
        }
    }
}

/// Budget overrides; each absent field takes its default.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetsDraft {
    pub max_tokens: Option<u64>,
    pub max_files: Option<u64>,
    pub max_per_file_tokens: Option<u64>,
    #[serde(default)]
    pub section_caps: SectionCapsDraft,
}

impl BudgetsDraft {
    pub fn resolve(&self) -> Budgets {
        Budgets {
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            max_files: self.max_files.unwrap_or(DEFAULT_MAX_FILES),
            max_per_file_tokens: self
                .max_per_file_tokens
                .unwrap_or(DEFAULT_MAX_PER_FILE_TOKENS),
            section_caps: self.section_caps.resolve(),
        }
    }
}

impl From<Budgets> for BudgetsDraft {
    fn from(b: Budgets) -> Self {
        let c = b.section_caps;
        Self {
            max_tokens: Some(b.max_tokens),
            max_files: Some(b.max_files),
            max_per_file_tokens: Some(b.max_per_file_tokens),
            section_caps: SectionCapsDraft {
                templates: Some(c.templates),
                spec_canvas: Some(c.spec_canvas),
                diff_slices: Some(c.diff_slices),
                linked_tests: Some(c.linked_tests),
                contracts: Some(c.contracts),
                extras: Some(c.extras),
            },
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemDraft {
    pub id: Option<String>,
    pub path: Option<String>,
    pub content: Option<String>,
    pub spans: Option<Vec<Span>>,
    pub symbol: Option<String>,
    pub loc: Option<Loc>,
    pub sha256: Option<String>,
    pub distance_to_diff: Option<u64>,
}

impl From<Item> for ItemDraft {
    fn from(item: Item) -> Self {
        Self {
            id: Some(item.id),
            path: item.path,
            content: item.content,
            spans: item.spans,
            symbol: item.symbol,
            loc: item.loc,
            sha256: item.sha256,
            distance_to_diff: item.distance_to_diff,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionDraft {
    pub name: SectionName,
    #[serde(default)]
    pub items: Vec<ItemDraft>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackDraft {
    pub version: Option<String>,
    pub project: Option<Project>,
    pub pr: Option<PullRequest>,
    pub mode: Option<Mode>,
    pub order: Option<Vec<SectionName>>,
    #[serde(default)]
    pub budgets: BudgetsDraft,
    #[serde(default)]
    pub sections: Vec<SectionDraft>,
    #[serde(default)]
    pub must_include: Vec<Locator>,
    #[serde(default)]
    pub nice_to_have: Vec<Locator>,
    #[serde(default)]
    pub never_include: Vec<NeverInclude>,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
    /// Only sealed packs carry one, and those are never rebuilt.
    pub hash: Option<String>,
}

impl PackDraft {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Default, normalize and seal a draft.
pub fn build_pack(draft: PackDraft) -> Result<Pack> {
    if draft.hash.is_some() {
        return Err(PackError::Validation(
            Violation::new(
                ErrorCode::SchemaInvalid,
                "/hash",
                "sealed packs are immutable and cannot be rebuilt",
            )
            .into(),
        ));
    }

    let mut missing = Vec::new();
    let mut sections: Vec<Section> = SectionName::ALL.into_iter().map(Section::empty).collect();

    for (i, section) in draft.sections.into_iter().enumerate() {
        let slot = &mut sections[section.name.index()];
        for (j, item) in section.items.into_iter().enumerate() {
            match build_item(item) {
                Some(item) => slot.items.push(item),
                None => missing.push(Violation::new(
                    ErrorCode::MissingRequired,
                    format!("/sections/{i}/items/{j}/id"),
                    "item needs an id, a path, a loc or content to derive one from",
                )),
            }
        }
    }
    if let Some(errors) = ValidationErrors::from_vec(missing) {
        return Err(PackError::Validation(errors));
    }

    let mut pack = Pack {
        version: draft.version.unwrap_or_else(|| PACK_VERSION.to_string()),
        project: draft.project.unwrap_or_else(|| Project {
            id: LOCAL_ID.to_string(),
        }),
        pr: draft.pr.unwrap_or_else(|| PullRequest {
            id: LOCAL_ID.to_string(),
            branch: LOCAL_ID.to_string(),
            commit_sha: LOCAL_COMMIT.to_string(),
        }),
        mode: draft.mode.unwrap_or(Mode::Pr),
        order: draft.order.unwrap_or_else(|| SectionName::ALL.to_vec()),
        budgets: draft.budgets.resolve(),
        sections,
        must_include: draft.must_include,
        nice_to_have: draft.nice_to_have,
        never_include: draft.never_include,
        provenance: draft.provenance,
        hash: String::new(),
    };

    // Derived from the content so rebuilding the same draft reproduces it.
    let created_at = derived_timestamp(&seal_hash(&pack)?);
    pack.provenance.push(Provenance {
        source: ProvenanceSource::Builder,
        generator: format!("ctxpack-core/{}", crate::VERSION),
        created_at,
        reason: None,
    });

    let pack = seal(pack)?;
    debug!(items = pack.item_count(), hash = %pack.hash, "built pack");
    Ok(pack)
}

/// Parse and build a draft from raw JSON.
pub fn build_pack_value(value: Value) -> Result<Pack> {
    build_pack(PackDraft::from_value(value)?)
}

fn build_item(draft: ItemDraft) -> Option<Item> {
    let mut item = Item {
        id: String::new(),
        path: draft.path,
        content: draft.content,
        spans: draft.spans,
        symbol: draft.symbol,
        loc: draft.loc,
        sha256: draft.sha256,
        distance_to_diff: draft.distance_to_diff,
    };
    let text = item.text();

    if item.sha256.is_none() {
        item.sha256 = text.as_deref().map(sha256_hex);
    }

    item.id = match draft.id {
        Some(id) if !id.is_empty() => id,
        _ => match item.effective_path() {
            Some(path) => Item::default_id(path, item.symbol.as_deref()),
            None => {
                let sha = item.sha256.as_deref()?;
                format!("sha256:{}", sha.get(..12).unwrap_or(sha))
            }
        },
    };
    Some(item)
}
