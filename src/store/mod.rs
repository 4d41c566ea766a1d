pub mod planner;
pub mod writer;

pub use planner::{PathPlanner, PlanError};

use serde::Deserialize;

/// Name of the per-merge-request index written next to the diffs.
pub const MANIFEST_FILE: &str = "manifest.json";

/// What to put on disk for binary files, which carry no diff text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryPolicy {
    /// Zero-byte `.diff` file
    #[default]
    Marker,
    /// Nothing; the file is still listed in the manifest
    Omit,
}
