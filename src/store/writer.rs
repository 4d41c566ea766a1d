use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::planner::DIFF_EXTENSION;

/// Temporary files are named `.mrdiff-XXXXXX.tmp` next to their target.
pub const TEMP_PREFIX: &str = ".mrdiff-";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Write `content` to `path` so readers see either the old file or the
/// complete new one.
///
/// The bytes go to a temporary file in the target directory, are synced, then
/// renamed over `path`. Parent directories are created as needed.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<u64> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(content.len() as u64)
}

/// Async wrapper running `write_atomic` on the blocking pool. The write runs
/// to completion even if the awaiting future is dropped.
pub async fn write(path: PathBuf, content: Vec<u8>) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &content))
        .await
        .map_err(io::Error::other)?
}

/// Remove `.diff` files and orphaned temporary files left below `mr_dir` by
/// earlier runs, then prune directories that became empty. Other files are
/// left alone. Returns how many files were removed.
pub fn clear_previous(mr_dir: &Path) -> io::Result<usize> {
    if !mr_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(mr_dir).min_depth(1).contents_first(true) {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type().is_dir() {
            if fs::read_dir(path)?.next().is_none() {
                fs::remove_dir(path)?;
            }
            continue;
        }

        if is_stale(path) {
            debug!(path = %path.display(), "removing stale file");
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_stale(path: &Path) -> bool {
    let is_diff = path.extension().is_some_and(|ext| ext == DIFF_EXTENSION);
    let is_orphan = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX));
    is_diff || is_orphan
}
