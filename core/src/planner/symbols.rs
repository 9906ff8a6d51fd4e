//! Line-oriented scanning for top-level function declarations and relative
//! imports. No parsing: a declaration is a line starting at column 0 that
//! looks like `function name`, `fn name` or `def name`.

use std::sync::LazyLock;

use regex_lite::Regex;

static FUNCTION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)",
    )
    .ok()
});

static RUST_FN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .ok()
});

static DEF_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)").ok());

static IMPORT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bimport\s+(?:[^'"]*?\s+from\s+)?|\bexport\s+[^'"]*?\s+from\s+|\brequire\s*\(\s*|\bimport\s*\(\s*)['"](\.{1,2}/[^'"]+)['"]"#,
    )
    .ok()
});

/// A declared function with its 1-based inclusive line range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub start_line: u64,
    pub end_line: u64,
}

impl Symbol {
    /// Lines `start_line..=end_line` of `content`.
    pub fn slice(&self, content: &str) -> String {
        let skip = usize::try_from(self.start_line.saturating_sub(1)).unwrap_or(usize::MAX);
        let take = usize::try_from(self.end_line + 1 - self.start_line).unwrap_or(usize::MAX);
        content
            .lines()
            .skip(skip)
            .take(take)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn declared_name(line: &str) -> Option<String> {
    [&FUNCTION_RE, &RUST_FN_RE, &DEF_RE]
        .into_iter()
        .filter_map(|re| LazyLock::force(re).as_ref())
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Top-level function symbols in declaration order. Each symbol runs until
/// the line before the next one; trailing blank lines are not included.
pub fn extract_symbols(content: &str) -> Vec<Symbol> {
    let lines: Vec<&str> = content.lines().collect();
    let starts: Vec<(usize, String)> = lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| declared_name(line).map(|name| (idx, name)))
        .collect();

    let mut symbols = Vec::with_capacity(starts.len());
    for (n, (start, name)) in starts.iter().enumerate() {
        let mut end = starts
            .get(n + 1)
            .map_or(lines.len(), |(next, _)| *next)
            .saturating_sub(1);
        while end > *start && lines[end].trim().is_empty() {
            end -= 1;
        }
        symbols.push(Symbol {
            name: name.clone(),
            start_line: *start as u64 + 1,
            end_line: end as u64 + 1,
        });
    }
    symbols
}

/// Relative module specifiers (`./x`, `../y`) referenced by `import`,
/// `export ... from`, `require()` or dynamic `import()`, deduplicated in
/// first-seen order.
pub fn relative_imports(content: &str) -> Vec<String> {
    let Some(re) = LazyLock::force(&IMPORT_RE).as_ref() else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for caps in re.captures_iter(content) {
        if let Some(spec) = caps.get(1)
            && !out.iter().any(|s| s == spec.as_str())
        {
            out.push(spec.as_str().to_string());
        }
    }
    out
}
