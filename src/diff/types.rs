use serde::{Deserialize, Serialize};
use std::fmt;

/// How a file changed within the merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    /// Binary content; no diff text is assembled or written
    BinarySkip,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Added => write!(f, "added"),
            FileStatus::Modified => write!(f, "modified"),
            FileStatus::Deleted => write!(f, "deleted"),
            FileStatus::Renamed => write!(f, "renamed"),
            FileStatus::BinarySkip => write!(f, "binary_skip"),
        }
    }
}

/// One file's final, assembled diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    /// Complete unified diff text including its `diff --git` header.
    /// Empty for binary entries.
    pub diff: String,
    pub status: FileStatus,
    /// GitLab withheld the hunks and no raw-diff substitute was found
    pub truncated: bool,
}

impl FileDiff {
    /// Path the file is known by after the change (the old path for deletions
    /// reported without a new path).
    pub fn path(&self) -> &str {
        if self.new_path.is_empty() {
            &self.old_path
        } else {
            &self.new_path
        }
    }
}

/// A change entry that could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("change entry #{position} has neither an old nor a new path")]
pub struct MalformedEntry {
    /// Zero-based position of the entry across all pages
    pub position: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_falls_back_to_old_path() {
        let diff = FileDiff {
            old_path: "docs/readme.md".to_string(),
            new_path: String::new(),
            diff: String::new(),
            status: FileStatus::Deleted,
            truncated: false,
        };
        assert_eq!(diff.path(), "docs/readme.md");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FileStatus::BinarySkip).unwrap(),
            "\"binary_skip\""
        );
        assert_eq!(FileStatus::Renamed.to_string(), "renamed");
    }
}
