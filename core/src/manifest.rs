//! Assembler output.
//!
//! The manifest is what a prompt builder reads: canonically ordered,
//! budget-respecting sections plus the bookkeeping needed to audit what was
//! left out and why.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::Sealable;
use crate::types::SectionName;

/// Reference from a pointer slot to the placed item holding the content.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemRef {
    pub section: SectionName,
    pub id: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<bool>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ItemRef>,
}

impl ManifestItem {
    pub fn is_pointer(&self) -> bool {
        self.pointer == Some(true)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSection {
    pub name: SectionName,
    pub items: Vec<ManifestItem>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Totals {
    pub tokens: u64,
    pub files: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointerRecord {
    pub from_id: String,
    pub to_id: String,
}

/// Why a candidate did not make it into the manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Could not be compressed under `max_per_file_tokens`.
    PerFileCap,
    /// The section's file cap was reached.
    SectionCap,
    /// The section's token ceiling was reached.
    SectionTokenCap,
    /// `max_files` was reached.
    MaxFiles,
    /// `max_tokens` was reached.
    MaxTokens,
    /// Duplicate content whose first occurrence was itself evicted.
    DuplicateOfEvicted,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerFileCap => "per_file_cap",
            Self::SectionCap => "section_cap",
            Self::SectionTokenCap => "section_token_cap",
            Self::MaxFiles => "max_files",
            Self::MaxTokens => "max_tokens",
            Self::DuplicateOfEvicted => "duplicate_of_evicted",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Eviction {
    pub section: SectionName,
    pub id: String,
    pub reason: EvictionReason,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metrics {
    pub per_section: BTreeMap<SectionName, Totals>,
    /// Pointer substitutions.
    pub deduped: u64,
    /// Items whose text was produced by merging spans.
    pub merged_spans: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: String,
    pub model: String,
    pub sections: Vec<ManifestSection>,
    pub totals: Totals,
    pub pointers: Vec<PointerRecord>,
    pub evictions: Vec<Eviction>,
    pub metrics: Metrics,
    #[serde(default)]
    pub hash: String,
}

impl Manifest {
    pub fn section(&self, name: SectionName) -> Option<&ManifestSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Ids of every slot (content and pointer) in manifest order.
    pub fn item_ids(&self) -> Vec<&str> {
        self.sections
            .iter()
            .flat_map(|s| s.items.iter().map(|i| i.id.as_str()))
            .collect()
    }
}

impl Sealable for Manifest {
    fn declared_hash(&self) -> &str {
        &self.hash
    }

    fn set_hash(&mut self, hash: String) {
        self.hash = hash;
    }
}
