use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::diff::{FileDiff, FileStatus, MalformedEntry};
use crate::gitlab::MergeRequestRef;
use crate::store::PlanError;

/// Overall outcome of one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Complete,
    /// At least one entry failed; all others were written
    Partial,
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestStatus::Complete => write!(f, "complete"),
            ManifestStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    MalformedResponse,
    InvalidPath,
    Io,
}

/// Why a single file could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub kind: EntryErrorKind,
    pub message: String,
}

impl From<&MalformedEntry> for EntryError {
    fn from(err: &MalformedEntry) -> Self {
        Self {
            kind: EntryErrorKind::MalformedResponse,
            message: err.to_string(),
        }
    }
}

impl From<&PlanError> for EntryError {
    fn from(err: &PlanError) -> Self {
        let kind = match err {
            PlanError::Collision { .. } => EntryErrorKind::MalformedResponse,
            PlanError::InvalidPath { .. } | PlanError::InvalidProject(_) => EntryErrorKind::InvalidPath,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<&io::Error> for EntryError {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: EntryErrorKind::Io,
            message: err.to_string(),
        }
    }
}

/// One file's line in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path the file is known by after the change
    pub path: String,
    pub old_path: String,
    pub new_path: String,
    /// Absent when the entry could not be classified
    pub status: Option<FileStatus>,
    /// Absent when nothing was written
    pub written_path: Option<PathBuf>,
    pub bytes: u64,
    /// Hunks were withheld by GitLab and could not be recovered
    #[serde(default)]
    pub truncated: bool,
    pub error: Option<EntryError>,
}

impl ManifestEntry {
    pub fn for_file(file: &FileDiff) -> Self {
        Self {
            path: file.path().to_string(),
            old_path: file.old_path.clone(),
            new_path: file.new_path.clone(),
            status: Some(file.status),
            written_path: None,
            bytes: 0,
            truncated: file.truncated,
            error: None,
        }
    }

    pub fn malformed(err: &MalformedEntry) -> Self {
        Self {
            path: String::new(),
            old_path: String::new(),
            new_path: String::new(),
            status: None,
            written_path: None,
            bytes: 0,
            truncated: false,
            error: Some(err.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of one `fetch_merge_request_diffs` call, in assembly order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadManifest {
    pub project_id: String,
    pub mr_iid: u64,
    pub status: ManifestStatus,
    pub entries: Vec<ManifestEntry>,
}

impl DownloadManifest {
    pub fn new(mr: &MergeRequestRef, entries: Vec<ManifestEntry>) -> Self {
        let status = if entries.iter().any(ManifestEntry::is_failed) {
            ManifestStatus::Partial
        } else {
            ManifestStatus::Complete
        };
        Self {
            project_id: mr.project_id.clone(),
            mr_iid: mr.iid,
            status,
            entries,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_failed()).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}
