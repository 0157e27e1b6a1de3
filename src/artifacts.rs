//! Scratch storage for jobs.
//!
//! Every job gets its own directory under the store root, holding the
//! uploaded input, a staging file the OCR tool writes into, and the final
//! output once the staging file has been renamed into place. The directory
//! is removed when the job's [`ArtifactScope`] is released, on every path
//! out of the pipeline.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use uuid::Uuid;

use crate::{
    pipeline::{FailureKind, PipelineError, request::Document},
    prelude::*,
};

/// Prefix for per-job directories. Anything under the store root with this
/// prefix belongs to us, and is fair game for [`ArtifactStore::sweep_stale`].
const SCOPE_PREFIX: &str = "job-";

/// How much space we reserve per input byte: one copy for the input, one for
/// the OCRed output.
const RESERVATION_FACTOR: u64 = 2;

/// Shared counters, so we can check that nothing leaks.
#[derive(Debug, Default)]
struct StoreCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    reserved_bytes: AtomicU64,
}

/// Snapshot of [`ArtifactStore`] accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Scopes handed out since start-up.
    pub acquired: usize,
    /// Scopes released since start-up.
    pub released: usize,
    /// Scopes currently alive.
    pub live: usize,
    /// Bytes currently reserved against the quota.
    pub reserved_bytes: u64,
}

/// Hands out per-job [`ArtifactScope`]s.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
    counters: Arc<StoreCounters>,
}

impl ArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf, quota_bytes: Option<u64>) -> Result<Self> {
        std::fs::create_dir_all(&root).with_context(|| {
            format!("failed to create scratch directory {:?}", root.display())
        })?;
        Ok(Self {
            root,
            quota_bytes,
            counters: Arc::new(StoreCounters::default()),
        })
    }

    /// The directory we allocate scopes in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove job directories left behind by a previous process that died
    /// without cleaning up. Call once, before serving.
    #[instrument(level = "debug", skip_all, fields(root = %self.root.display()))]
    pub fn sweep_stale(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = self.root.read_dir().with_context(|| {
            format!("failed to read scratch directory {:?}", self.root.display())
        })?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in {:?}", self.root.display())
            })?;
            let is_ours = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SCOPE_PREFIX));
            if !is_ours || !entry.path().is_dir() {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    path = %entry.path().display(),
                    "failed to remove stale job directory: {}",
                    err
                ),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale job directories");
        }
        Ok(removed)
    }

    /// Allocate a scope for `job_id` and write `document` into it.
    ///
    /// Any failure here is [`FailureKind::ResourceExhausted`], and happens
    /// before the OCR tool is ever started.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id, len = document.len()))]
    pub async fn acquire(
        &self,
        job_id: Uuid,
        document: &Document,
    ) -> Result<ArtifactScope, PipelineError> {
        let reserved = (document.len() as u64).saturating_mul(RESERVATION_FACTOR);
        self.reserve(reserved)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{SCOPE_PREFIX}{job_id}-"))
            .tempdir_in(&self.root)
            .with_context(|| {
                format!("failed to create job directory in {:?}", self.root.display())
            });
        let dir = match dir {
            Ok(dir) => dir,
            Err(err) => {
                self.unreserve(reserved);
                return Err(PipelineError::resource_exhausted(&err));
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let path = dir.path().to_owned();
        let scope = ArtifactScope {
            dir: Some(dir),
            input: path.join("input.pdf"),
            staging: path.join("output.partial.pdf"),
            output: path.join("output.pdf"),
            reserved,
            counters: self.counters.clone(),
        };

        // If this fails, dropping `scope` cleans up.
        tokio::fs::write(&scope.input, &document.bytes)
            .await
            .with_context(|| format!("failed to write {:?}", scope.input.display()))
            .map_err(|err| PipelineError::resource_exhausted(&err))?;
        Ok(scope)
    }

    /// Current accounting.
    pub fn stats(&self) -> StoreStats {
        let acquired = self.counters.acquired.load(Ordering::SeqCst);
        let released = self.counters.released.load(Ordering::SeqCst);
        StoreStats {
            acquired,
            released,
            live: acquired.saturating_sub(released),
            reserved_bytes: self.counters.reserved_bytes.load(Ordering::SeqCst),
        }
    }

    /// Reserve quota, or fail without changing anything.
    fn reserve(&self, bytes: u64) -> Result<(), PipelineError> {
        let quota = self.quota_bytes;
        self.counters
            .reserved_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current
                    .checked_add(bytes)
                    .filter(|&total| quota.is_none_or(|quota| total <= quota))
            })
            .map(|_| ())
            .map_err(|current| {
                PipelineError::new(
                    FailureKind::ResourceExhausted,
                    format!(
                        "scratch quota exceeded: need {bytes} bytes, {current} of {} in use",
                        quota.unwrap_or(u64::MAX)
                    ),
                )
            })
    }

    fn unreserve(&self, bytes: u64) {
        self.counters.reserved_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// One job's scratch files. Released exactly once, either explicitly with
/// [`ArtifactScope::release`] or on drop.
#[derive(Debug)]
pub struct ArtifactScope {
    dir: Option<tempfile::TempDir>,
    input: PathBuf,
    staging: PathBuf,
    output: PathBuf,
    reserved: u64,
    counters: Arc<StoreCounters>,
}

impl ArtifactScope {
    /// The uploaded document.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Where the OCR tool should write. Never read by clients.
    pub fn staging_output(&self) -> &Path {
        &self.staging
    }

    /// The finished document. Only exists after [`Self::commit_output`].
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Atomically move the staging file to the output path. A half-written
    /// staging file is never visible at the output path.
    pub async fn commit_output(&self) -> Result<()> {
        tokio::fs::rename(&self.staging, &self.output)
            .await
            .with_context(|| {
                format!(
                    "failed to move {:?} to {:?}",
                    self.staging.display(),
                    self.output.display()
                )
            })
    }

    /// Read the finished document.
    pub async fn read_output(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.output)
            .await
            .with_context(|| format!("failed to read {:?}", self.output.display()))
    }

    /// Delete our files and give back our quota. Calling this more than once
    /// does nothing.
    pub fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let dir_path = dir.path().to_owned();
        if let Err(err) = dir.close() {
            error!(
                directory = ?dir_path.display(),
                "failed to delete job directory: {}",
                err
            );
        }
        self.counters
            .reserved_bytes
            .fetch_sub(self.reserved, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        trace!(directory = ?dir_path.display(), "Released job directory");
    }
}

impl Drop for ArtifactScope {
    fn drop(&mut self) {
        self.release();
    }
}
