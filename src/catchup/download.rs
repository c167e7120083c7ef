//! Download steps: descriptors, checkpoint files and bucket files.

use super::SharedHas;
use crate::archive::{Archive, FileCategory, HistoryArchiveState};
use crate::bucket::BucketStore;
use crate::error::{ArchiveError, Error, StreamError, VerifyError};
use crate::metrics::CatchupMetrics;
use crate::types::Hash256;
use crate::work::{StepResult, Work};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Fetch one remote file from the first readable archive that has it.
/// Archives are asked in configuration order; the last failure is
/// reported when none succeeds.
fn fetch_from_any(archives: &[Archive], remote: &str, local: &Path) -> Result<(), ArchiveError> {
    let mut last = None;
    for archive in archives.iter().filter(|a| a.readable()) {
        match archive.fetch(remote, local) {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(archive = archive.name(), remote, error = %err, "fetch failed");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or(ArchiveError::NoReadableArchives))
}

fn classify(err: ArchiveError) -> StepResult {
    if err.is_transient() {
        StepResult::RetryableFailure(err.into())
    } else {
        StepResult::FatalFailure(err.into())
    }
}

/// Fetch and parse the snapshot descriptor published at one checkpoint,
/// delivering it through a shared slot.
pub struct GetHistoryArchiveStateWork {
    checkpoint: u32,
    archives: Vec<Archive>,
    dir: PathBuf,
    slot: SharedHas,
    metrics: Arc<CatchupMetrics>,
}

impl GetHistoryArchiveStateWork {
    pub fn new(
        checkpoint: u32,
        archives: Vec<Archive>,
        dir: PathBuf,
        slot: SharedHas,
        metrics: Arc<CatchupMetrics>,
    ) -> Self {
        GetHistoryArchiveStateWork {
            checkpoint,
            archives,
            dir,
            slot,
            metrics,
        }
    }
}

impl Work for GetHistoryArchiveStateWork {
    fn name(&self) -> &str {
        "get-history-archive-state"
    }

    fn status(&self) -> String {
        format!("fetching archive state at checkpoint {}", self.checkpoint)
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        let remote = FileCategory::Has.remote_checkpoint_path(self.checkpoint);
        let local = self
            .dir
            .join(FileCategory::Has.checkpoint_basename(self.checkpoint));
        if let Err(err) = fs::create_dir_all(&self.dir) {
            return StepResult::RetryableFailure(err.into());
        }
        if let Err(err) = fetch_from_any(&self.archives, &remote, &local) {
            return classify(err);
        }
        let text = match fs::read_to_string(&local) {
            Ok(text) => text,
            Err(err) => return StepResult::RetryableFailure(err.into()),
        };
        let has = match HistoryArchiveState::from_text(&text) {
            Ok(has) => has,
            Err(err) => {
                return StepResult::FatalFailure(StreamError::Codec(err.to_string()).into())
            }
        };
        if has.current_ledger != self.checkpoint {
            return StepResult::FatalFailure(
                StreamError::Codec(format!(
                    "descriptor at checkpoint {} claims ledger {}",
                    self.checkpoint, has.current_ledger
                ))
                .into(),
            );
        }
        self.metrics.history_archive_states_fetched.inc();
        *self.slot.lock() = Some(has);
        StepResult::Success
    }
}

/// Download the checkpoint files of one category across a checkpoint
/// span, one file per step.
pub struct DownloadCheckpointFilesWork {
    category: FileCategory,
    checkpoints: Vec<u32>,
    idx: usize,
    archives: Vec<Archive>,
    dir: PathBuf,
    metrics: Arc<CatchupMetrics>,
}

impl DownloadCheckpointFilesWork {
    pub fn new(
        category: FileCategory,
        checkpoints: Vec<u32>,
        archives: Vec<Archive>,
        dir: PathBuf,
        metrics: Arc<CatchupMetrics>,
    ) -> Self {
        DownloadCheckpointFilesWork {
            category,
            checkpoints,
            idx: 0,
            archives,
            dir,
            metrics,
        }
    }
}

impl Work for DownloadCheckpointFilesWork {
    fn name(&self) -> &str {
        "download-checkpoint-files"
    }

    fn status(&self) -> String {
        format!(
            "downloading {} files ({}/{})",
            self.category.prefix(),
            self.idx,
            self.checkpoints.len()
        )
    }

    fn reset(&mut self) {
        self.idx = 0;
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        let Some(&checkpoint) = self.checkpoints.get(self.idx) else {
            return StepResult::Success;
        };
        if let Err(err) = fs::create_dir_all(&self.dir) {
            return StepResult::RetryableFailure(err.into());
        }
        let remote = self.category.remote_checkpoint_path(checkpoint);
        let local = self.dir.join(self.category.checkpoint_basename(checkpoint));
        if let Err(err) = fetch_from_any(&self.archives, &remote, &local) {
            return classify(err);
        }
        match self.category {
            FileCategory::Ledger => self.metrics.ledgers_downloaded.inc(),
            FileCategory::Transactions => self.metrics.transactions_downloaded.inc(),
            _ => {}
        }
        self.idx += 1;
        StepResult::Running
    }
}

/// Download the bucket files a restore descriptor references and are not
/// already present locally, ingesting each into the state store. One
/// bucket per step.
pub struct DownloadBucketsWork {
    has: SharedHas,
    buckets: Arc<dyn BucketStore>,
    archives: Vec<Archive>,
    dir: PathBuf,
    idx: usize,
    metrics: Arc<CatchupMetrics>,
}

impl DownloadBucketsWork {
    pub fn new(
        has: SharedHas,
        buckets: Arc<dyn BucketStore>,
        archives: Vec<Archive>,
        dir: PathBuf,
        metrics: Arc<CatchupMetrics>,
    ) -> Self {
        DownloadBucketsWork {
            has,
            buckets,
            archives,
            dir,
            idx: 0,
            metrics,
        }
    }
}

impl Work for DownloadBucketsWork {
    fn name(&self) -> &str {
        "download-buckets"
    }

    fn reset(&mut self) {
        self.idx = 0;
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        let Some(has) = self.has.lock().clone() else {
            return StepResult::FatalFailure(Error::Apply(
                "restore descriptor was never fetched".into(),
            ));
        };
        loop {
            let Some(hash) = has.buckets.get(self.idx).copied() else {
                return StepResult::Success;
            };
            if self.buckets.file_exists(&hash) {
                self.idx += 1;
                continue;
            }
            if let Err(err) = fs::create_dir_all(&self.dir) {
                return StepResult::RetryableFailure(err.into());
            }
            let remote = FileCategory::remote_bucket_path(&hash);
            let local = self.dir.join(format!("bucket-{}.dat", hash.to_hex()));
            if let Err(err) = fetch_from_any(&self.archives, &remote, &local) {
                return classify(err);
            }
            let bytes = match fs::read(&local) {
                Ok(bytes) => bytes,
                Err(err) => return StepResult::RetryableFailure(err.into()),
            };
            // Buckets are content-addressed; anything that does not hash
            // to its name never enters the state store.
            if Hash256::of(&bytes) != hash {
                return StepResult::FatalFailure(
                    VerifyError::BucketHashMismatch { hash }.into(),
                );
            }
            if let Err(err) = self.buckets.add_file(&hash, &bytes) {
                return if err.is_transient() {
                    StepResult::RetryableFailure(err)
                } else {
                    StepResult::FatalFailure(err)
                };
            }
            self.metrics.buckets_downloaded.inc();
            self.idx += 1;
            return StepResult::Running;
        }
    }
}
