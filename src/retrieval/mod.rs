pub mod types;

pub use types::{DownloadManifest, EntryError, EntryErrorKind, ManifestEntry, ManifestStatus};

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::diff::{self, FileStatus};
use crate::gitlab::{FetchError, GitLabClient, MergeRequestRef};
use crate::store::{writer, BinaryPolicy, PathPlanner, PlanError, MANIFEST_FILE};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Retrieval did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Retrieval was cancelled")]
    Cancelled,

    #[error("A retrieval of {0} into this directory is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Failed to prepare {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
}

impl RetrievalError {
    /// Stable machine-readable name used in tool output.
    pub fn kind(&self) -> &'static str {
        match self {
            RetrievalError::Fetch(err) => err.kind(),
            RetrievalError::Timeout(_) => "timeout_error",
            RetrievalError::Cancelled => "cancelled",
            RetrievalError::AlreadyRunning(_) => "already_running",
            RetrievalError::Plan(_) => "invalid_path_error",
            RetrievalError::Prepare { .. } => "io_error",
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        matches!(self, RetrievalError::Fetch(err) if err.retries_exhausted())
    }
}

/// Knobs for one `Retriever`, resolved from configuration by the caller.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub binary_policy: BinaryPolicy,
    /// Keep `.diff` files from earlier runs that the current change set lacks
    pub preserve_extra_files: bool,
    pub write_manifest: bool,
    /// Recover truncated entries from the `/raw_diffs` endpoint
    pub fill_truncated: bool,
    /// Upper bound on concurrent file writes
    pub concurrency: usize,
    pub operation_timeout: Duration,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            binary_policy: BinaryPolicy::default(),
            preserve_extra_files: false,
            write_manifest: true,
            fill_truncated: true,
            concurrency: DEFAULT_CONCURRENCY,
            operation_timeout: Duration::from_secs(300),
        }
    }
}

type InFlightKey = (String, u64, PathBuf);

/// Coordinates fetch, assembly, planning and writing for one merge request.
///
/// Fetch failures abort the retrieval. Anything that goes wrong with a single
/// file is recorded on its manifest entry and the rest are still written.
pub struct Retriever {
    client: GitLabClient,
    options: RetrievalOptions,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl Retriever {
    pub fn new(client: GitLabClient, options: RetrievalOptions) -> Self {
        Self {
            client,
            options,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn client(&self) -> &GitLabClient {
        &self.client
    }

    /// Populate `root/<project>/<iid>/` with the merge request's diffs.
    ///
    /// Only one retrieval per (project, iid, root) may run at a time on this
    /// `Retriever`; a concurrent call is rejected. Cancellation and the
    /// operation timeout drop the in-progress work: writes already handed to
    /// the blocking pool still finish through their rename, anything else
    /// leaves at most an orphaned temporary file for the next run to remove.
    #[instrument(skip(self, root, cancel), fields(mr = %mr, root = %root.display()))]
    pub async fn retrieve(
        &self,
        mr: &MergeRequestRef,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadManifest, RetrievalError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, in_flight_key(mr, root))
            .ok_or_else(|| RetrievalError::AlreadyRunning(mr.to_string()))?;

        let timeout = self.options.operation_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("retrieval cancelled");
                Err(RetrievalError::Cancelled)
            }
            result = tokio::time::timeout(timeout, self.run(mr, root)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(timeout_secs = timeout.as_secs_f64(), "retrieval timed out");
                    Err(RetrievalError::Timeout(timeout))
                }
            },
        }
    }

    async fn run(&self, mr: &MergeRequestRef, root: &Path) -> Result<DownloadManifest, RetrievalError> {
        let mut planner = PathPlanner::new(root, mr)?;

        let pages = self.client.fetch_changes(mr).await?;
        let mut assembled = diff::assemble(&pages);
        info!(pages = pages.len(), files = assembled.len(), "assembled change set");

        let truncated = assembled
            .iter()
            .filter(|r| matches!(r, Ok(f) if f.truncated))
            .count();
        if self.options.fill_truncated && truncated > 0 {
            match self.client.fetch_raw_diff(mr).await {
                Ok(raw) => {
                    let filled = diff::fill_truncated(
                        assembled.iter_mut().filter_map(|r| r.as_mut().ok()),
                        &raw,
                    );
                    info!(truncated, filled, "recovered truncated diffs");
                }
                Err(err) => warn!(error = %err, truncated, "raw diff unavailable, truncated files stay truncated"),
            }
        }

        let mut entries = Vec::with_capacity(assembled.len());
        let mut jobs = Vec::new();
        for item in assembled {
            let file = match item {
                Ok(file) => file,
                Err(malformed) => {
                    entries.push(ManifestEntry::malformed(&malformed));
                    continue;
                }
            };

            let mut entry = ManifestEntry::for_file(&file);
            match planner.plan(&file) {
                Ok(path) => {
                    let omit = file.status == FileStatus::BinarySkip
                        && self.options.binary_policy == BinaryPolicy::Omit;
                    if !omit {
                        jobs.push((entries.len(), path, file.diff.into_bytes()));
                    }
                }
                Err(err) => {
                    warn!(path = %entry.path, error = %err, "skipping file");
                    entry.error = Some((&err).into());
                }
            }
            entries.push(entry);
        }

        let mr_dir = planner.mr_dir().to_path_buf();
        if !self.options.preserve_extra_files {
            let dir = mr_dir.clone();
            let removed = tokio::task::spawn_blocking(move || writer::clear_previous(&dir))
                .await
                .map_err(io::Error::other)
                .and_then(|r| r)
                .map_err(|source| RetrievalError::Prepare {
                    path: mr_dir.clone(),
                    source,
                })?;
            debug!(removed, "cleared previous diffs");
        }

        let results: Vec<(usize, PathBuf, io::Result<u64>)> = stream::iter(jobs)
            .map(|(index, path, content)| async move {
                let result = writer::write(path.clone(), content).await;
                (index, path, result)
            })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        for (index, path, result) in results {
            let entry = &mut entries[index];
            match result {
                Ok(bytes) => {
                    entry.bytes = bytes;
                    entry.written_path = Some(path);
                }
                Err(err) => {
                    warn!(path = %entry.path, error = %err, "write failed");
                    entry.error = Some((&err).into());
                }
            }
        }

        let manifest = DownloadManifest::new(mr, entries);
        info!(
            files = manifest.entries.len(),
            failed = manifest.failed_count(),
            bytes = manifest.total_bytes(),
            status = %manifest.status,
            "retrieval finished"
        );

        if self.options.write_manifest {
            self.persist_manifest(&manifest, &mr_dir).await;
        }
        Ok(manifest)
    }

    /// The index is a convenience for re-inspection; failing to write it does
    /// not fail the retrieval.
    async fn persist_manifest(&self, manifest: &DownloadManifest, mr_dir: &Path) {
        let path = mr_dir.join(MANIFEST_FILE);
        let mut json = match serde_json::to_vec_pretty(manifest) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize manifest");
                return;
            }
        };
        json.push(b'\n');
        if let Err(err) = writer::write(path.clone(), json).await {
            warn!(path = %path.display(), error = %err, "failed to write manifest index");
        }
    }
}

/// `dl` and `./dl` name the same directory and must share a key.
fn in_flight_key(mr: &MergeRequestRef, root: &Path) -> InFlightKey {
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    (mr.project_id.clone(), mr.iid, root)
}

/// Marks a (project, iid, root) retrieval as running until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<InFlightKey>>>, key: InFlightKey) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        inserted.then(|| Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}
