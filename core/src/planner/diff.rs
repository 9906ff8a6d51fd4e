//! Unified diff header parsing.
//!
//! Only file-level information is recovered: which paths were touched and
//! how (added, modified, deleted, renamed). Hunk bodies are skipped.

use serde::{Deserialize, Serialize};

use crate::paths::normalize_path;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Post-change path (pre-change path for deletions).
    pub path: String,
    /// Pre-change path of a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    pub status: ChangeStatus,
}

struct Pending {
    change: FileChange,
    /// `---`/`+++` lines already applied.
    has_file_lines: bool,
}

/// Touched files in order of first appearance; a path listed twice keeps
/// its last status.
pub fn parse_unified_diff(diff: &str) -> Vec<FileChange> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut changes: Vec<FileChange> = Vec::new();
    let mut current: Option<Pending> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut current, &mut changes);
            let (old, new) = split_git_header(rest);
            current = Some(Pending {
                change: FileChange {
                    path: new.or(old).unwrap_or_default(),
                    renamed_from: None,
                    status: ChangeStatus::Modified,
                },
                has_file_lines: false,
            });
        } else if let Some(old) = line.strip_prefix("--- ")
            && let Some(new) = lines.get(i + 1).and_then(|next| next.strip_prefix("+++ "))
        {
            let (old, new) = (header_path(old), header_path(new));
            let status = match (&old, &new) {
                (None, _) => ChangeStatus::Added,
                (_, None) => ChangeStatus::Deleted,
                _ => ChangeStatus::Modified,
            };
            let path = new.or(old).unwrap_or_default();

            match current.as_mut() {
                Some(pending) if !pending.has_file_lines => {
                    if pending.change.status != ChangeStatus::Renamed {
                        pending.change.status = status;
                    }
                    if !path.is_empty() {
                        pending.change.path = path;
                    }
                    pending.has_file_lines = true;
                }
                _ => {
                    flush(&mut current, &mut changes);
                    current = Some(Pending {
                        change: FileChange {
                            path,
                            renamed_from: None,
                            status,
                        },
                        has_file_lines: true,
                    });
                }
            }
            i += 2;
            continue;
        } else if let Some(pending) = current.as_mut().filter(|p| !p.has_file_lines) {
            if line.starts_with("new file mode") {
                pending.change.status = ChangeStatus::Added;
            } else if line.starts_with("deleted file mode") {
                pending.change.status = ChangeStatus::Deleted;
            } else if let Some(from) = line.strip_prefix("rename from ") {
                pending.change.renamed_from = Some(normalize_path(from.trim()));
                pending.change.status = ChangeStatus::Renamed;
            } else if let Some(to) = line.strip_prefix("rename to ") {
                pending.change.path = normalize_path(to.trim());
                pending.change.status = ChangeStatus::Renamed;
            }
        }
        i += 1;
    }
    flush(&mut current, &mut changes);
    changes
}

fn flush(current: &mut Option<Pending>, changes: &mut Vec<FileChange>) {
    let Some(pending) = current.take() else {
        return;
    };
    if pending.change.path.is_empty() {
        return;
    }
    match changes.iter_mut().find(|c| c.path == pending.change.path) {
        Some(existing) => *existing = pending.change,
        None => changes.push(pending.change),
    }
}

/// `a/old b/new` -> (old, new).
fn split_git_header(rest: &str) -> (Option<String>, Option<String>) {
    match rest.rfind(" b/") {
        Some(idx) => (header_path(&rest[..idx]), header_path(&rest[idx + 1..])),
        None => (None, header_path(rest)),
    }
}

/// Path from a `---`/`+++` line: drops timestamps and the `a/`/`b/`
/// prefix; `/dev/null` means "no file on this side".
fn header_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw.is_empty() || raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(normalize_path(stripped))
}
