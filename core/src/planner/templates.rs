//! Label-driven template selection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const API_TEMPLATE: &str = "templates/api-route-contract.md";
pub const DB_TEMPLATE: &str = "templates/db-migration-invariants.md";
pub const UI_TEMPLATE: &str = "templates/ui-guidelines.md";
pub const GENERIC_TEMPLATE: &str = "templates/generic.md";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl TemplateRef {
    pub fn path_only(path: &str) -> Self {
        Self {
            path: path.to_string(),
            content: None,
        }
    }
}

/// External source of templates keyed by label.
pub trait TemplateRegistry {
    /// Templates for `label`, or `None` to fall back to the built-in choice.
    fn lookup(&self, label: &str) -> Option<Vec<TemplateRef>>;
}

impl TemplateRegistry for BTreeMap<String, Vec<TemplateRef>> {
    fn lookup(&self, label: &str) -> Option<Vec<TemplateRef>> {
        self.get(label).filter(|refs| !refs.is_empty()).cloned()
    }
}

/// Where a selected template came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemplateOrigin {
    Registry,
    Builtin,
}

/// Built-in label heuristic.
pub fn builtin_template(label: &str) -> Option<&'static str> {
    match label.trim().to_ascii_lowercase().as_str() {
        "api" => Some(API_TEMPLATE),
        "db" => Some(DB_TEMPLATE),
        "ui" => Some(UI_TEMPLATE),
        _ => None,
    }
}

/// Templates for a label set, sorted by path and deduplicated. The registry
/// wins per label; the generic template is used only when nothing else was
/// selected.
pub fn select_templates(
    labels: &[String],
    registry: Option<&dyn TemplateRegistry>,
) -> Vec<(TemplateRef, TemplateOrigin)> {
    let mut labels: Vec<&str> = labels.iter().map(String::as_str).collect();
    labels.sort_unstable();
    labels.dedup();

    let mut selected: BTreeMap<String, (TemplateRef, TemplateOrigin)> = BTreeMap::new();
    for label in labels {
        if let Some(refs) = registry.and_then(|r| r.lookup(label)) {
            for r in refs {
                selected
                    .entry(r.path.clone())
                    .or_insert((r, TemplateOrigin::Registry));
            }
        } else if let Some(path) = builtin_template(label) {
            selected
                .entry(path.to_string())
                .or_insert((TemplateRef::path_only(path), TemplateOrigin::Builtin));
        }
    }

    if selected.is_empty() {
        let generic = registry
            .and_then(|r| r.lookup("generic"))
            .map(|refs| {
                refs.into_iter()
                    .map(|r| (r, TemplateOrigin::Registry))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| {
                vec![(
                    TemplateRef::path_only(GENERIC_TEMPLATE),
                    TemplateOrigin::Builtin,
                )]
            });
        for (r, origin) in generic {
            selected.entry(r.path.clone()).or_insert((r, origin));
        }
    }

    selected.into_values().collect()
}
