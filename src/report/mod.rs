use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

use crate::diff::FileStatus;
use crate::gitlab::MergeRequestSummary;
use crate::retrieval::{DownloadManifest, ManifestStatus};
use crate::tool::MergeRequestListing;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to serialize output: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), ReportError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Human-readable manifest summary:
///
/// MR 42!7: complete | 2 files | 1234 bytes
///   modified  src/a.go -> /dl/42/7/src/a.go.diff (812 B)
///   deleted   docs/readme.md -> /dl/42/7/docs/readme.md.diff (422 B)
pub fn render_manifest(manifest: &DownloadManifest) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "MR {}!{}: {} | {} files | {} bytes",
        manifest.project_id,
        manifest.mr_iid,
        colorize_status(manifest.status),
        manifest.entries.len(),
        manifest.total_bytes()
    );

    if manifest.entries.is_empty() {
        let _ = writeln!(out, "  No changed files.");
    }

    for entry in &manifest.entries {
        let label = entry
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let label = format!("{label:<11}");
        let label = match entry.status {
            Some(FileStatus::Added) => label.green(),
            Some(FileStatus::Deleted) => label.red(),
            Some(FileStatus::Renamed) => label.cyan(),
            Some(FileStatus::BinarySkip) | None => label.dimmed(),
            Some(FileStatus::Modified) => label.yellow(),
        };

        let name = if entry.path.is_empty() { "<no path>" } else { &entry.path };
        match (&entry.error, &entry.written_path) {
            (Some(err), _) => {
                let _ = writeln!(out, "  {label}{name} {} {}", "FAILED".red().bold(), err.message);
            }
            (None, Some(path)) => {
                let truncated = if entry.truncated { " [truncated]" } else { "" };
                let _ = writeln!(
                    out,
                    "  {label}{name} -> {} ({} B){truncated}",
                    path.display(),
                    entry.bytes
                );
            }
            (None, None) => {
                let _ = writeln!(out, "  {label}{name} (not written)");
            }
        }
    }
    out
}

pub fn print_manifest(manifest: &DownloadManifest) {
    print!("{}", render_manifest(manifest));
}

/// Listing in the shape:
///
/// Merge Requests (2 found):
/// 1. [opened] !12 - Fix login
///    Author: Dev | fix -> main | Created: 2026-03-01
///    URL: https://...
///
/// A single result also gets description, votes, assignees and labels.
/// With `color` off the text carries no escape codes.
pub fn render_merge_requests(merge_requests: &[MergeRequestSummary], color: bool) -> String {
    if merge_requests.is_empty() {
        return "No merge requests found.\n".to_string();
    }
    let detailed = merge_requests.len() == 1;

    let mut out = String::new();
    let _ = writeln!(out, "Merge Requests ({} found):", merge_requests.len());
    let _ = writeln!(out, "{}", "=".repeat(60));

    for (i, mr) in merge_requests.iter().enumerate() {
        let state = match mr.state.as_str() {
            "opened" => paint(color, &mr.state, |s| s.green()),
            "closed" => paint(color, &mr.state, |s| s.red()),
            _ => paint(color, &mr.state, |s| s.yellow()),
        };
        let title = paint(color, &mr.title, |s| s.bold());
        let _ = writeln!(out, "{}. [{}] !{} - {}", i + 1, state, mr.iid, title);
        let created = mr.created_at.get(..10).unwrap_or(&mr.created_at);
        let _ = writeln!(
            out,
            "   Author: {} | {} -> {} | Created: {}",
            mr.author.name, mr.source_branch, mr.target_branch, created
        );

        if detailed {
            let description = mr.description.as_deref().unwrap_or("No description");
            let short: String = description.chars().take(100).collect();
            let _ = writeln!(out, "   Description: {short}");
            let _ = writeln!(out, "   Votes: +{} -{}", mr.upvotes, mr.downvotes);
            if !mr.assignees.is_empty() {
                let names: Vec<&str> = mr.assignees.iter().map(|a| a.name.as_str()).collect();
                let _ = writeln!(out, "   Assignees: {}", names.join(", "));
            }
            if !mr.labels.is_empty() {
                let _ = writeln!(out, "   Labels: {}", mr.labels.join(", "));
            }
        }
        let _ = writeln!(out, "   URL: {}", mr.web_url);
        out.push('\n');
    }
    out
}

pub fn print_merge_requests(listing: &MergeRequestListing) {
    print!("{}", render_merge_requests(&listing.merge_requests, true));
}

fn paint(color: bool, text: &str, style: impl Fn(&str) -> ColoredString) -> String {
    if color {
        style(text).to_string()
    } else {
        text.to_string()
    }
}

fn colorize_status(status: ManifestStatus) -> ColoredString {
    match status {
        ManifestStatus::Complete => "complete".green().bold(),
        ManifestStatus::Partial => "partial".yellow().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlab::{GitLabUser, MergeRequestRef};
    use crate::retrieval::{EntryError, EntryErrorKind, ManifestEntry};
    use std::path::PathBuf;

    fn sample_manifest() -> DownloadManifest {
        DownloadManifest::new(
            &MergeRequestRef::new("42", 7),
            vec![
                ManifestEntry {
                    path: "src/a.go".to_string(),
                    old_path: "src/a.go".to_string(),
                    new_path: "src/a.go".to_string(),
                    status: Some(FileStatus::Modified),
                    written_path: Some(PathBuf::from("/dl/42/7/src/a.go.diff")),
                    bytes: 120,
                    truncated: false,
                    error: None,
                },
                ManifestEntry {
                    path: "../x".to_string(),
                    old_path: "../x".to_string(),
                    new_path: "../x".to_string(),
                    status: Some(FileStatus::Added),
                    written_path: None,
                    bytes: 0,
                    truncated: false,
                    error: Some(EntryError {
                        kind: EntryErrorKind::InvalidPath,
                        message: "Refusing unsafe path".to_string(),
                    }),
                },
            ],
        )
    }

    fn sample_merge_requests(count: u64) -> Vec<MergeRequestSummary> {
        (1..=count)
            .map(|iid| MergeRequestSummary {
                iid,
                title: format!("Change {iid}"),
                state: "opened".to_string(),
                author: GitLabUser {
                    id: 1,
                    username: "alice".to_string(),
                    name: "Alice".to_string(),
                    email: None,
                },
                source_branch: "feature".to_string(),
                target_branch: "main".to_string(),
                created_at: "2026-05-04T12:00:00Z".to_string(),
                updated_at: None,
                web_url: format!("https://gitlab.example.com/g/p/-/merge_requests/{iid}"),
                description: Some("Adds the thing".to_string()),
                assignees: vec![],
                labels: vec!["backend".to_string()],
                upvotes: 2,
                downvotes: 0,
                author_email: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_render_manifest_lists_entries() {
        let text = render_manifest(&sample_manifest());
        assert!(text.contains("MR 42!7"));
        assert!(text.contains("2 files"));
        assert!(text.contains("src/a.go -> /dl/42/7/src/a.go.diff (120 B)"));
        assert!(text.contains("Refusing unsafe path"));
    }

    #[test]
    fn test_render_empty_manifest() {
        let manifest = DownloadManifest::new(&MergeRequestRef::new("42", 7), vec![]);
        assert!(render_manifest(&manifest).contains("No changed files."));
    }

    #[test]
    fn test_render_single_merge_request_shows_details() {
        let text = render_merge_requests(&sample_merge_requests(1), true);
        assert!(text.contains("Merge Requests (1 found):"));
        assert!(text.contains("Created: 2026-05-04"));
        assert!(text.contains("Description: Adds the thing"));
        assert!(text.contains("Labels: backend"));
    }

    #[test]
    fn test_render_many_merge_requests_is_compact() {
        let text = render_merge_requests(&sample_merge_requests(3), true);
        assert!(text.contains("Merge Requests (3 found):"));
        assert!(!text.contains("Description:"));
        assert!(text.contains("merge_requests/3"));
    }

    #[test]
    fn test_render_no_merge_requests() {
        assert_eq!(render_merge_requests(&[], true), "No merge requests found.\n");
    }

    #[test]
    fn test_plain_render_has_no_escape_codes() {
        let text = render_merge_requests(&sample_merge_requests(2), false);
        assert!(!text.contains('\u{1b}'));
        assert!(text.contains("1. [opened] !1 - Change 1\n"));
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&sample_manifest()).unwrap();
    }
}
