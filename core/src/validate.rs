//! Structural and semantic pack validation.
//!
//! Runs over the raw JSON document so that every problem maps to a stable
//! code and a location, instead of surfacing as an opaque deserializer
//! message. Checks run in a fixed order and at most [`MAX_VIOLATIONS`] are
//! collected, so the output is deterministic for a given input.
//!
//! Content integrity (does `hash` match?) is not checked here; that is the
//! gate's and the assembler's job.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, PackError, Result, ValidationErrors, Violation};
use crate::hash::is_hex64;
use crate::types::{PACK_MAJOR_PREFIX, PACK_VERSION, Pack, ProvenanceSource, SectionName};

/// Upper bound on collected violations.
pub const MAX_VIOLATIONS: usize = 64;

/// Minimum length of an opaque commit token.
pub const MIN_COMMIT_SHA_LEN: usize = 7;

/// Closed set of top-level keys.
pub const TOP_LEVEL_KEYS: [&str; 12] = [
    "version",
    "project",
    "pr",
    "mode",
    "order",
    "budgets",
    "sections",
    "must_include",
    "nice_to_have",
    "never_include",
    "provenance",
    "hash",
];

const MODES: [&str; 3] = ["MVP", "PR", "FIX"];
const LOCATOR_KINDS: [&str; 3] = ["file", "symbol", "span"];
const ITEM_KEYS: [&str; 8] = [
    "id",
    "path",
    "content",
    "spans",
    "symbol",
    "loc",
    "sha256",
    "distance_to_diff",
];
const BUDGET_KEYS: [&str; 4] = [
    "max_tokens",
    "max_files",
    "max_per_file_tokens",
    "section_caps",
];

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidateOptions {
    /// Require `order` and `sections` to follow the canonical index.
    pub strict_order: bool,
    /// Accept `1.x.y` versions other than the supported one (with a warning).
    pub allow_minor_version: bool,
}

impl ValidateOptions {
    pub fn strict() -> Self {
        Self {
            strict_order: true,
            allow_minor_version: false,
        }
    }
}

/// Non-fatal findings from a successful validation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Validate a raw pack document.
pub fn validate(value: &Value, opts: &ValidateOptions) -> Result<ValidationReport> {
    let mut c = Collector::default();

    let Some(root) = value.as_object() else {
        c.push(ErrorCode::SchemaInvalid, "", "pack must be a JSON object");
        return c.finish(value);
    };

    check_version(root, opts, &mut c);
    check_top_level_keys(root, &mut c);
    check_project(root, &mut c);
    check_pr(root, &mut c);
    check_mode(root, &mut c);
    check_order(root, opts, &mut c);
    check_budgets(root, &mut c);
    check_sections(root, opts, &mut c);
    for key in ["must_include", "nice_to_have"] {
        check_locators(root, key, &mut c);
    }
    check_never_include(root, &mut c);
    check_provenance(root, &mut c);
    check_hash(root, &mut c);

    c.finish(value)
}

/// Validate a typed pack.
pub fn validate_pack(pack: &Pack, opts: &ValidateOptions) -> Result<ValidationReport> {
    validate(&pack.to_value()?, opts)
}

#[derive(Default)]
struct Collector {
    violations: Vec<Violation>,
    warnings: Vec<String>,
}

impl Collector {
    fn push(&mut self, code: ErrorCode, path: impl Into<String>, message: impl Into<String>) {
        if self.violations.len() < MAX_VIOLATIONS {
            self.violations.push(Violation::new(code, path, message));
        }
    }

    fn finish(mut self, value: &Value) -> Result<ValidationReport> {
        if self.violations.is_empty() {
            // Anything the rules above missed still has to parse, and the
            // typed form must re-serialize to the sealed document.
            match serde_json::from_value::<Pack>(value.clone()) {
                Err(e) => self.push(ErrorCode::SchemaInvalid, "", e.to_string()),
                Ok(pack) => {
                    if serde_json::to_value(&pack).ok().as_ref() != Some(value) {
                        self.push(
                            ErrorCode::SchemaInvalid,
                            "",
                            "document does not round-trip through the pack schema",
                        );
                    }
                }
            }
        }
        match ValidationErrors::from_vec(self.violations) {
            Some(errors) => Err(PackError::Validation(errors)),
            None => {
                for w in &self.warnings {
                    tracing::warn!(warning = %w, "pack validation warning");
                }
                Ok(ValidationReport {
                    warnings: self.warnings,
                })
            }
        }
    }

    /// Fetch a required key, recording MISSING_REQUIRED when absent.
    fn required<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'a Value> {
        let v = obj.get(key);
        if v.is_none() {
            self.push(
                ErrorCode::MissingRequired,
                format!("{path}/{key}"),
                format!("'{key}' is required"),
            );
        }
        v
    }

    fn required_object<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'a Map<String, Value>> {
        let v = self.required(obj, key, path)?;
        let o = v.as_object();
        if o.is_none() {
            self.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/{key}"),
                format!("'{key}' must be an object"),
            );
        }
        o
    }

    fn required_string(
        &mut self,
        obj: &Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<String> {
        let v = self.required(obj, key, path)?;
        match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.to_string()),
            _ => {
                self.push(
                    ErrorCode::SchemaInvalid,
                    format!("{path}/{key}"),
                    format!("'{key}' must be a non-empty string"),
                );
                None
            }
        }
    }

    fn required_array<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'a Vec<Value>> {
        self.required(obj, key, path)?;
        self.optional_array(obj, key, path)
    }

    fn optional_array<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'a Vec<Value>> {
        let v = obj.get(key)?;
        let arr = v.as_array();
        if arr.is_none() {
            self.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/{key}"),
                format!("'{key}' must be an array"),
            );
        }
        arr
    }

    fn closed_keys(&mut self, obj: &Map<String, Value>, allowed: &[&str], path: &str) {
        let mut unknown: Vec<&String> = obj
            .keys()
            .filter(|k| !allowed.contains(&k.as_str()))
            .collect();
        unknown.sort();
        for key in unknown {
            self.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/{key}"),
                format!("unknown field '{key}'"),
            );
        }
    }

    fn non_negative_int(&mut self, v: &Value, path: String) {
        if v.as_u64().is_none() {
            self.push(
                ErrorCode::SchemaInvalid,
                path,
                "must be a non-negative integer",
            );
        }
    }
}

fn check_version(root: &Map<String, Value>, opts: &ValidateOptions, c: &mut Collector) {
    let Some(v) = c.required(root, "version", "") else {
        return;
    };
    let Some(version) = v.as_str() else {
        c.push(ErrorCode::SchemaInvalid, "/version", "'version' must be a string");
        return;
    };
    if version == PACK_VERSION {
        return;
    }
    if is_same_major(version) {
        if opts.allow_minor_version {
            c.warnings.push(format!(
                "pack version {version} accepted under compatibility mode (supported: {PACK_VERSION})"
            ));
        } else {
            c.push(
                ErrorCode::SchemaInvalid,
                "/version",
                format!("version {version} requires the minor-version compatibility flag"),
            );
        }
    } else {
        c.push(
            ErrorCode::SchemaInvalid,
            "/version",
            format!("unsupported version {version} (expected {PACK_VERSION})"),
        );
    }
}

fn is_same_major(version: &str) -> bool {
    let Some(rest) = version.strip_prefix(PACK_MAJOR_PREFIX) else {
        return false;
    };
    let parts: Vec<&str> = rest.split('.').collect();
    parts.len() == 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

fn check_top_level_keys(root: &Map<String, Value>, c: &mut Collector) {
    c.closed_keys(root, &TOP_LEVEL_KEYS, "");
}

fn check_project(root: &Map<String, Value>, c: &mut Collector) {
    let Some(project) = c.required_object(root, "project", "") else {
        return;
    };
    c.required_string(project, "id", "/project");
    c.closed_keys(project, &["id"], "/project");
}

fn check_pr(root: &Map<String, Value>, c: &mut Collector) {
    let Some(pr) = c.required_object(root, "pr", "") else {
        return;
    };
    c.required_string(pr, "id", "/pr");
    c.required_string(pr, "branch", "/pr");
    if let Some(sha) = c.required_string(pr, "commit_sha", "/pr")
        && (sha.len() < MIN_COMMIT_SHA_LEN || sha.chars().any(char::is_whitespace))
    {
        c.push(
            ErrorCode::SchemaInvalid,
            "/pr/commit_sha",
            format!("commit_sha must be a token of at least {MIN_COMMIT_SHA_LEN} characters"),
        );
    }
    c.closed_keys(pr, &["id", "branch", "commit_sha"], "/pr");
}

fn check_mode(root: &Map<String, Value>, c: &mut Collector) {
    let Some(mode) = c.required(root, "mode", "") else {
        return;
    };
    if !mode.as_str().is_some_and(|m| MODES.contains(&m)) {
        c.push(
            ErrorCode::SchemaInvalid,
            "/mode",
            format!("mode must be one of {}", MODES.join("|")),
        );
    }
}

fn check_order(root: &Map<String, Value>, opts: &ValidateOptions, c: &mut Collector) {
    let Some(order) = c.required(root, "order", "") else {
        return;
    };
    let Some(entries) = order.as_array() else {
        c.push(ErrorCode::SchemaInvalid, "/order", "'order' must be an array");
        return;
    };
    let mut seen = BTreeSet::new();
    let mut last: Option<SectionName> = None;
    for (i, entry) in entries.iter().enumerate() {
        let path = format!("/order/{i}");
        let Some(name) = entry.as_str().and_then(SectionName::parse) else {
            c.push(ErrorCode::InvalidOrder, path, "not a canonical section name");
            continue;
        };
        if !seen.insert(name) {
            c.push(
                ErrorCode::InvalidOrder,
                path,
                format!("section '{name}' appears more than once"),
            );
            continue;
        }
        if opts.strict_order
            && let Some(prev) = last
            && name < prev
        {
            c.push(
                ErrorCode::InvalidOrder,
                path,
                format!("'{name}' must not follow '{prev}'"),
            );
        }
        last = Some(name);
    }
}

fn check_budgets(root: &Map<String, Value>, c: &mut Collector) {
    let Some(budgets) = c.required_object(root, "budgets", "") else {
        return;
    };
    for key in ["max_tokens", "max_files", "max_per_file_tokens"] {
        if let Some(v) = c.required(budgets, key, "/budgets") {
            c.non_negative_int(v, format!("/budgets/{key}"));
        }
    }
    c.closed_keys(budgets, &BUDGET_KEYS, "/budgets");

    let Some(caps) = c.required_object(budgets, "section_caps", "/budgets") else {
        return;
    };
    for name in SectionName::ALL {
        if let Some(v) = c.required(caps, name.as_str(), "/budgets/section_caps") {
            c.non_negative_int(v, format!("/budgets/section_caps/{name}"));
        }
    }
    let names: Vec<&str> = SectionName::ALL.iter().map(SectionName::as_str).collect();
    c.closed_keys(caps, &names, "/budgets/section_caps");
}

fn check_sections(root: &Map<String, Value>, opts: &ValidateOptions, c: &mut Collector) {
    let Some(sections) = c.required(root, "sections", "") else {
        return;
    };
    let Some(sections) = sections.as_array() else {
        c.push(ErrorCode::SchemaInvalid, "/sections", "'sections' must be an array");
        return;
    };

    let mut seen = BTreeSet::new();
    let mut last: Option<SectionName> = None;
    for (i, section) in sections.iter().enumerate() {
        let path = format!("/sections/{i}");
        let Some(obj) = section.as_object() else {
            c.push(ErrorCode::SchemaInvalid, path, "section must be an object");
            continue;
        };
        c.closed_keys(obj, &["name", "items"], &path);

        if let Some(name) = c.required(obj, "name", &path) {
            match name.as_str().and_then(SectionName::parse) {
                None => c.push(
                    ErrorCode::SchemaInvalid,
                    format!("{path}/name"),
                    "not a canonical section name",
                ),
                Some(name) => {
                    if !seen.insert(name) {
                        c.push(
                            ErrorCode::SchemaInvalid,
                            format!("{path}/name"),
                            format!("section '{name}' appears more than once"),
                        );
                    }
                    if opts.strict_order
                        && let Some(prev) = last
                        && name < prev
                    {
                        c.push(
                            ErrorCode::InvalidOrder,
                            format!("{path}/name"),
                            format!("section '{name}' must not follow '{prev}'"),
                        );
                    }
                    last = Some(name);
                }
            }
        }

        if let Some(items) = c.required_array(obj, "items", &path) {
            let mut ids = BTreeSet::new();
            for (j, item) in items.iter().enumerate() {
                check_item(item, &format!("{path}/items/{j}"), &mut ids, c);
            }
        }
    }
}

fn check_item(item: &Value, path: &str, ids: &mut BTreeSet<String>, c: &mut Collector) {
    let Some(obj) = item.as_object() else {
        c.push(ErrorCode::SchemaInvalid, path, "item must be an object");
        return;
    };
    c.closed_keys(obj, &ITEM_KEYS, path);

    if let Some(id) = c.required_string(obj, "id", path)
        && !ids.insert(id.clone())
    {
        c.push(
            ErrorCode::SchemaInvalid,
            format!("{path}/id"),
            format!("duplicate item id '{id}' in section"),
        );
    }
    for key in ["path", "content", "symbol"] {
        if let Some(v) = obj.get(key)
            && !v.is_string()
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/{key}"),
                format!("'{key}' must be a string"),
            );
        }
    }
    if let Some(sha) = obj.get("sha256")
        && !sha.as_str().is_some_and(is_hex64)
    {
        c.push(
            ErrorCode::SchemaInvalid,
            format!("{path}/sha256"),
            "sha256 must be 64 hex characters",
        );
    }
    if let Some(d) = obj.get("distance_to_diff") {
        c.non_negative_int(d, format!("{path}/distance_to_diff"));
    }
    if let Some(spans) = c.optional_array(obj, "spans", path) {
        for (k, span) in spans.iter().enumerate() {
            let ok = span
                .as_object()
                .is_some_and(|s| s.len() == 1 && s.get("text").is_some_and(Value::is_string));
            if !ok {
                c.push(
                    ErrorCode::SchemaInvalid,
                    format!("{path}/spans/{k}"),
                    "span must be {\"text\": string}",
                );
            }
        }
    }
    if let Some(loc) = obj.get("loc") {
        check_loc(loc, &format!("{path}/loc"), c);
    }
}

fn check_loc(loc: &Value, path: &str, c: &mut Collector) {
    let Some(obj) = loc.as_object() else {
        c.push(ErrorCode::SchemaInvalid, path, "loc must be an object");
        return;
    };
    c.closed_keys(obj, &["path", "start_line", "end_line"], path);
    c.required_string(obj, "path", path);
    let start = c.required(obj, "start_line", path).map(Value::as_u64);
    match start {
        Some(Some(line)) if line >= 1 => {
            if let Some(end) = obj.get("end_line") {
                match end.as_u64() {
                    Some(end) if end >= line => {}
                    _ => c.push(
                        ErrorCode::SchemaInvalid,
                        format!("{path}/end_line"),
                        "end_line must be an integer >= start_line",
                    ),
                }
            }
        }
        Some(_) => c.push(
            ErrorCode::SchemaInvalid,
            format!("{path}/start_line"),
            "start_line must be an integer >= 1",
        ),
        None => {}
    }
}

fn check_locators(root: &Map<String, Value>, key: &str, c: &mut Collector) {
    let Some(entries) = c.required_array(root, key, "") else {
        return;
    };
    for (i, entry) in entries.iter().enumerate() {
        let path = format!("/{key}/{i}");
        let Some(obj) = entry.as_object() else {
            c.push(ErrorCode::SchemaInvalid, path, "locator must be an object");
            continue;
        };
        c.closed_keys(obj, &["kind", "section", "loc", "sha256", "source"], &path);

        if let Some(kind) = c.required(obj, "kind", &path)
            && !kind.as_str().is_some_and(|k| LOCATOR_KINDS.contains(&k))
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/kind"),
                format!("kind must be one of {}", LOCATOR_KINDS.join("|")),
            );
        }
        if let Some(section) = c.required(obj, "section", &path)
            && section.as_str().and_then(SectionName::parse).is_none()
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/section"),
                "not a canonical section name",
            );
        }
        if let Some(loc) = c.required(obj, "loc", &path) {
            check_loc(loc, &format!("{path}/loc"), c);
        }
        if let Some(sha) = c.required(obj, "sha256", &path)
            && !sha.as_str().is_some_and(is_hex64)
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/sha256"),
                "sha256 must be 64 hex characters",
            );
        }
        if let Some(source) = c.required(obj, "source", &path)
            && source.as_str().and_then(ProvenanceSource::parse).is_none()
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/source"),
                "unknown provenance source",
            );
        }
    }
}

fn check_never_include(root: &Map<String, Value>, c: &mut Collector) {
    let Some(entries) = c.required_array(root, "never_include", "") else {
        return;
    };
    for (i, entry) in entries.iter().enumerate() {
        let path = format!("/never_include/{i}");
        match entry {
            Value::String(s) if !s.trim().is_empty() => {}
            Value::Object(obj) => {
                c.closed_keys(obj, &["path", "start_line", "end_line", "symbol"], &path);
                c.required_string(obj, "path", &path);
                for key in ["start_line", "end_line"] {
                    if let Some(v) = obj.get(key) {
                        c.non_negative_int(v, format!("{path}/{key}"));
                    }
                }
                if let Some(v) = obj.get("symbol")
                    && !v.is_string()
                {
                    c.push(
                        ErrorCode::SchemaInvalid,
                        format!("{path}/symbol"),
                        "'symbol' must be a string",
                    );
                }
            }
            _ => c.push(
                ErrorCode::SchemaInvalid,
                path,
                "never_include entry must be a glob string or a span matcher",
            ),
        }
    }
}

fn check_provenance(root: &Map<String, Value>, c: &mut Collector) {
    let Some(entries) = c.required_array(root, "provenance", "") else {
        return;
    };
    for (i, entry) in entries.iter().enumerate() {
        let path = format!("/provenance/{i}");
        let Some(obj) = entry.as_object() else {
            c.push(ErrorCode::SchemaInvalid, path, "provenance record must be an object");
            continue;
        };
        c.closed_keys(obj, &["source", "generator", "created_at", "reason"], &path);
        if let Some(source) = c.required(obj, "source", &path)
            && source.as_str().and_then(ProvenanceSource::parse).is_none()
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/source"),
                "unknown provenance source",
            );
        }
        c.required_string(obj, "generator", &path);
        c.required_string(obj, "created_at", &path);
        if let Some(reason) = obj.get("reason")
            && !reason.is_string()
        {
            c.push(
                ErrorCode::SchemaInvalid,
                format!("{path}/reason"),
                "'reason' must be a string",
            );
        }
    }
}

fn check_hash(root: &Map<String, Value>, c: &mut Collector) {
    let Some(hash) = c.required(root, "hash", "") else {
        return;
    };
    if !hash.as_str().is_some_and(is_hex64) {
        c.push(
            ErrorCode::SchemaInvalid,
            "/hash",
            "hash must be 64 hex characters",
        );
    }
}
