use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use super::MANIFEST_FILE;
use crate::diff::FileDiff;
use crate::gitlab::{encode_project, MergeRequestRef};

pub const DIFF_EXTENSION: &str = "diff";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Refusing unsafe path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("{path:?} conflicts on disk with {existing:?}")]
    Collision { path: String, existing: String },

    #[error("Project id {0:?} cannot be used as a directory name")]
    InvalidProject(String),
}

/// Maps files of one merge request to `root/<project>/<iid>/<path>.diff`.
///
/// Server paths are validated, never rewritten: anything that could leave the
/// merge request directory is rejected. Every planned file and every directory
/// it implies is remembered, so a second file landing on the same destination,
/// a file landing on a planned directory, or a directory passing through a
/// planned file is reported as a collision. The manifest name is reserved.
#[derive(Debug)]
pub struct PathPlanner {
    mr_dir: PathBuf,
    /// Planned file -> remote path that claimed it
    files: HashMap<PathBuf, String>,
    /// Implied directory -> first remote path that needed it
    dirs: HashMap<PathBuf, String>,
}

impl PathPlanner {
    pub fn new(root: &Path, mr: &MergeRequestRef) -> Result<Self, PlanError> {
        let project_dir = encode_project(&mr.project_id);
        if !is_single_normal_component(&project_dir) {
            return Err(PlanError::InvalidProject(mr.project_id.clone()));
        }
        let mr_dir = root.join(project_dir).join(mr.iid.to_string());
        let mut files = HashMap::new();
        files.insert(mr_dir.join(MANIFEST_FILE), MANIFEST_FILE.to_string());
        Ok(Self {
            mr_dir,
            files,
            dirs: HashMap::new(),
        })
    }

    /// Directory holding this merge request's diffs and manifest.
    pub fn mr_dir(&self) -> &Path {
        &self.mr_dir
    }

    pub fn plan(&mut self, diff: &FileDiff) -> Result<PathBuf, PlanError> {
        let file_path = diff.path();
        let relative = relative_diff_path(file_path)?;
        let path = self.mr_dir.join(&relative);
        let parents: Vec<PathBuf> = relative
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| self.mr_dir.join(p))
            .collect();

        let clash = self
            .files
            .get(&path)
            .or_else(|| self.dirs.get(&path))
            .or_else(|| parents.iter().find_map(|dir| self.files.get(dir)));
        if let Some(existing) = clash {
            return Err(PlanError::Collision {
                path: file_path.to_string(),
                existing: existing.clone(),
            });
        }

        self.files.insert(path.clone(), file_path.to_string());
        for dir in parents {
            self.dirs.entry(dir).or_insert_with(|| file_path.to_string());
        }
        Ok(path)
    }
}

/// `src/a.go` becomes `src/a.go.diff`.
pub fn relative_diff_path(file_path: &str) -> Result<PathBuf, PlanError> {
    let invalid = |reason| PlanError::InvalidPath {
        path: file_path.to_string(),
        reason,
    };

    if file_path.is_empty() {
        return Err(invalid("empty path"));
    }
    if file_path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if file_path.starts_with('/') {
        return Err(invalid("absolute path"));
    }

    let segments: Vec<&str> = file_path.split('/').collect();
    let mut relative = PathBuf::new();
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
        if !is_single_normal_component(segment) {
            return Err(invalid("segment is not a plain file name on this platform"));
        }
        if i + 1 == segments.len() {
            relative.push(format!("{segment}.{DIFF_EXTENSION}"));
        } else {
            relative.push(segment);
        }
    }
    Ok(relative)
}

fn is_single_normal_component(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && segment != "." && segment != ".."
}
