pub mod raw;
pub mod types;

pub use types::{FileDiff, FileStatus, MalformedEntry};

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::gitlab::{ChangePage, RawChangeEntry};

/// Assembly result for one distinct file, in first-appearance order.
pub type Assembled = Result<FileDiff, MalformedEntry>;

/// Fold change pages into one `FileDiff` per distinct `(old_path, new_path)`.
///
/// Files keep the order in which they first appear across pages. When a pair
/// shows up again (page overlap, retried page) the later fragment replaces the
/// earlier one only if it is non-empty and at least as long; otherwise the
/// first entry stands. An entry with neither path cannot be classified and is
/// returned as a `MalformedEntry` in its position without affecting the rest.
pub fn assemble(pages: &[ChangePage]) -> Vec<Assembled> {
    let mut slots: Vec<Result<RawChangeEntry, MalformedEntry>> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut position = 0usize;

    for page in pages {
        for entry in &page.entries {
            let current = position;
            position += 1;

            if entry.old_path.is_empty() && entry.new_path.is_empty() {
                warn!(position = current, page = %page.page, "change entry has no paths, skipping");
                slots.push(Err(MalformedEntry { position: current }));
                continue;
            }

            let key = (entry.old_path.clone(), entry.new_path.clone());
            match index.get(&key) {
                Some(&slot) => {
                    if let Ok(existing) = &mut slots[slot] {
                        if should_replace(&existing.diff, &entry.diff) {
                            debug!(path = %entry.new_path, page = %page.page, "replacing earlier fragment");
                            existing.diff = entry.diff.clone();
                            existing.truncated = entry.truncated;
                        } else {
                            debug!(path = %entry.new_path, page = %page.page, "keeping earlier fragment");
                        }
                    }
                }
                None => {
                    index.insert(key, slots.len());
                    slots.push(Ok(entry.clone()));
                }
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.map(|entry| build_file_diff(&entry)))
        .collect()
}

fn should_replace(current: &str, candidate: &str) -> bool {
    !candidate.is_empty() && candidate.len() >= current.len()
}

/// Classify a change entry. Rename beats delete, delete beats binary.
pub fn classify(entry: &RawChangeEntry) -> FileStatus {
    let has_both = !entry.old_path.is_empty() && !entry.new_path.is_empty();
    if entry.renamed && has_both && entry.old_path != entry.new_path {
        FileStatus::Renamed
    } else if entry.deleted {
        FileStatus::Deleted
    } else if entry.binary {
        FileStatus::BinarySkip
    } else if entry.new_file || entry.old_path.is_empty() {
        FileStatus::Added
    } else {
        FileStatus::Modified
    }
}

fn build_file_diff(entry: &RawChangeEntry) -> FileDiff {
    let status = classify(entry);
    FileDiff {
        old_path: entry.old_path.clone(),
        new_path: entry.new_path.clone(),
        diff: render(entry, status),
        status,
        truncated: status != FileStatus::BinarySkip && entry.truncated && entry.diff.is_empty(),
    }
}

/// Prefix the server fragment with the git header it omits. The fragment
/// itself is appended unchanged.
fn render(entry: &RawChangeEntry, status: FileStatus) -> String {
    if status == FileStatus::BinarySkip {
        return String::new();
    }
    if entry.diff.starts_with("diff --git ") {
        return entry.diff.clone();
    }

    let old = if entry.old_path.is_empty() {
        &entry.new_path
    } else {
        &entry.old_path
    };
    let new = if entry.new_path.is_empty() {
        &entry.old_path
    } else {
        &entry.new_path
    };

    let mut out = format!("diff --git a/{old} b/{new}\n");
    match status {
        FileStatus::Added => {
            if let Some(mode) = &entry.b_mode {
                out.push_str(&format!("new file mode {mode}\n"));
            }
        }
        FileStatus::Deleted => {
            if let Some(mode) = &entry.a_mode {
                out.push_str(&format!("deleted file mode {mode}\n"));
            }
        }
        FileStatus::Modified | FileStatus::Renamed => {
            if let (Some(a), Some(b)) = (&entry.a_mode, &entry.b_mode) {
                if a != b {
                    out.push_str(&format!("old mode {a}\nnew mode {b}\n"));
                }
            }
            if status == FileStatus::Renamed {
                out.push_str(&format!("rename from {old}\nrename to {new}\n"));
            }
        }
        FileStatus::BinarySkip => {}
    }

    if !entry.diff.is_empty() {
        let from = if status == FileStatus::Added {
            "/dev/null".to_string()
        } else {
            format!("a/{old}")
        };
        let to = if status == FileStatus::Deleted {
            "/dev/null".to_string()
        } else {
            format!("b/{new}")
        };
        out.push_str(&format!("--- {from}\n+++ {to}\n"));
        out.push_str(&entry.diff);
    }
    out
}

/// Substitute sections of a whole-MR raw diff for files GitLab truncated.
/// Returns how many files were filled.
pub fn fill_truncated<'a>(files: impl IntoIterator<Item = &'a mut FileDiff>, raw_diff: &str) -> usize {
    let sections = raw::split_raw_diff(raw_diff);
    let mut filled = 0;

    for file in files.into_iter().filter(|f| f.truncated) {
        let section = sections
            .iter()
            .find(|s| s.old_path == file.old_path && s.new_path == file.new_path)
            .or_else(|| sections.iter().find(|s| s.new_path == file.path()));
        match section {
            Some(section) if section.text.len() > file.diff.len() => {
                debug!(path = %file.path(), bytes = section.text.len(), "filled truncated diff from raw diff");
                file.diff = section.text.clone();
                file.truncated = false;
                filled += 1;
            }
            _ => warn!(path = %file.path(), "no raw diff section for truncated file"),
        }
    }
    filled
}
