//! POSIX-stable path handling shared by ordering, matching and planning.

use wildmatch::WildMatch;

/// Normalize a path for ordering and comparison.
///
/// Backslashes become forward slashes, a leading drive letter (`C:`) is
/// dropped, leading `./` segments and trailing slashes are stripped.
pub fn normalize_path(path: &str) -> String {
    let mut s = path.replace('\\', "/");

    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        s.drain(..2);
    }

    let mut rest = s.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    let mut out = rest.to_string();

    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Resolve `relative` against the directory containing `from`, folding
/// `.` and `..` segments. Returns `None` when `..` escapes the root.
pub fn resolve_relative(from: &str, relative: &str) -> Option<String> {
    let from = normalize_path(from);
    let mut segments: Vec<&str> = from.split('/').collect();
    // Drop the file name.
    segments.pop();
    segments.retain(|s| !s.is_empty());

    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// Final path segment.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// File name without its last extension (`a/b.test.ts` -> `b.test`).
pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// Lowercased extension without the dot, if any.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(name[idx + 1..].to_ascii_lowercase()),
    }
}

/// Glob match (`*` and `?`) of a pattern against a path, both normalized.
///
/// `*` also matches `/`, so `secrets/*` covers nested files and `*.pem`
/// matches at any depth.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    let pattern = normalize_path(pattern);
    let path = normalize_path(path);
    pattern == path || WildMatch::new(&pattern).matches(&path)
}
