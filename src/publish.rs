//! The publication pipeline.
//!
//! Publishing one checkpoint runs three stages strictly in order:
//!
//! 1. [`ResolveMergesWork`]: wait until every bucket file the snapshot
//!    references exists locally, polling in-flight background merges.
//! 2. [`WriteSnapshotWork`]: write the snapshot descriptor, the
//!    ledger-header stream, the transaction stream and the referenced
//!    bucket files into a local staging directory.
//! 3. [`PutSnapshotFilesWork`]: upload every staged file to every
//!    writable archive, creating remote directories as needed.
//!
//! Stages 2 and 3 are idempotent whole-stage re-runs, so a transient
//! failure anywhere simply restarts the stage after backoff.

use crate::archive::{remote_dir_of, Archive, FileCategory, HistoryArchiveState, WELL_KNOWN_PATH};
use crate::bucket::BucketStore;
use crate::error::{ArchiveError, Error};
use crate::stream::RecordWriter;
use crate::types::{LedgerHeaderHistoryEntry, TransactionHistoryEntry};
use crate::work::{RetryPolicy, StepResult, Work, WorkSequence};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One staged file awaiting upload: its local staging path and the
/// remote name it publishes under.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub local: PathBuf,
    pub remote: String,
}

/// Immutable capture of everything one checkpoint publishes: the snapshot
/// descriptor plus the header and transaction records of its ledger
/// range. Shared by the pipeline stages through an `Arc`; only the staged
/// file list mutates as stages progress.
pub struct StateSnapshot {
    has: HistoryArchiveState,
    headers: Vec<LedgerHeaderHistoryEntry>,
    tx_sets: Vec<TransactionHistoryEntry>,
    staging_dir: PathBuf,
    compress: bool,
    files: Mutex<Vec<SnapshotFile>>,
}

impl StateSnapshot {
    /// Capture a snapshot for the checkpoint described by `has`.
    pub fn new(
        has: HistoryArchiveState,
        headers: Vec<LedgerHeaderHistoryEntry>,
        tx_sets: Vec<TransactionHistoryEntry>,
        staging_dir: impl Into<PathBuf>,
        compress: bool,
    ) -> Self {
        StateSnapshot {
            has,
            headers,
            tx_sets,
            staging_dir: staging_dir.into(),
            compress,
            files: Mutex::new(Vec::new()),
        }
    }

    /// The checkpoint ledger this snapshot captures.
    pub fn checkpoint(&self) -> u32 {
        self.has.current_ledger
    }

    /// The snapshot descriptor.
    pub fn has(&self) -> &HistoryArchiveState {
        &self.has
    }

    /// Staging directory for this checkpoint's files.
    pub fn dir(&self) -> PathBuf {
        self.staging_dir
            .join(format!("checkpoint-{:08x}", self.checkpoint()))
    }

    /// The staged files recorded so far.
    pub fn files(&self) -> Vec<SnapshotFile> {
        self.files.lock().clone()
    }

    fn clear_files(&self) {
        self.files.lock().clear();
    }

    fn add_file(&self, local: PathBuf, remote: String) {
        self.files.lock().push(SnapshotFile { local, remote });
    }

    /// Remove the staging directory after a confirmed publish.
    pub fn discard_staging(&self) {
        let _ = fs::remove_dir_all(self.dir());
    }
}

/// Stage 1: block until every referenced bucket file exists locally.
///
/// Bucket files can be outputs of background merges still running in the
/// state store; this stage polls their handles each crank. A referenced
/// file that is missing with no merge in flight can never appear, which
/// fails the pipeline.
pub struct ResolveMergesWork {
    snapshot: Arc<StateSnapshot>,
    buckets: Arc<dyn BucketStore>,
}

impl ResolveMergesWork {
    pub fn new(snapshot: Arc<StateSnapshot>, buckets: Arc<dyn BucketStore>) -> Self {
        ResolveMergesWork { snapshot, buckets }
    }
}

impl Work for ResolveMergesWork {
    fn name(&self) -> &str {
        "resolve-merges"
    }

    fn status(&self) -> String {
        format!("resolving merges for checkpoint {}", self.snapshot.checkpoint())
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        for hash in &self.snapshot.has().buckets {
            if self.buckets.file_exists(hash) {
                continue;
            }
            match self.buckets.merge_in_progress(hash) {
                Some(handle) => {
                    if handle.try_output().is_none() {
                        return StepResult::Waiting;
                    }
                    // Merge done; its output file lands momentarily.
                    return StepResult::Running;
                }
                None => return StepResult::FatalFailure(Error::MissingBucket(*hash)),
            }
        }
        debug!(
            checkpoint = self.snapshot.checkpoint(),
            "all referenced buckets resolved"
        );
        StepResult::Success
    }
}

/// Stage 2: write all publishable files into the staging directory.
///
/// One file per step: the descriptor, then the header stream, then the
/// transaction stream, then each bucket file. Write failures are local
/// I/O and therefore retryable; a retry restarts the whole stage over a
/// cleared file list.
pub struct WriteSnapshotWork {
    snapshot: Arc<StateSnapshot>,
    buckets: Arc<dyn BucketStore>,
    cursor: usize,
}

impl WriteSnapshotWork {
    pub fn new(snapshot: Arc<StateSnapshot>, buckets: Arc<dyn BucketStore>) -> Self {
        WriteSnapshotWork {
            snapshot,
            buckets,
            cursor: 0,
        }
    }

    fn write_one(&mut self) -> Result<bool, Error> {
        let snap = &self.snapshot;
        let checkpoint = snap.checkpoint();
        let dir = snap.dir();

        match self.cursor {
            0 => {
                fs::create_dir_all(&dir)?;
                let local = dir.join(FileCategory::Has.checkpoint_basename(checkpoint));
                fs::write(&local, snap.has().to_text())?;
                snap.add_file(
                    local.clone(),
                    FileCategory::Has.remote_checkpoint_path(checkpoint),
                );
                // The same descriptor also refreshes the archive's
                // most-recent-state pointer.
                snap.add_file(local, WELL_KNOWN_PATH.to_string());
            }
            1 => {
                let local = dir.join(FileCategory::Ledger.checkpoint_basename(checkpoint));
                let mut writer = RecordWriter::create(&local, snap.compress)?;
                for header in &snap.headers {
                    writer.write(header)?;
                }
                writer.finalize()?;
                snap.add_file(local, FileCategory::Ledger.remote_checkpoint_path(checkpoint));
            }
            2 => {
                let local = dir.join(FileCategory::Transactions.checkpoint_basename(checkpoint));
                let mut writer = RecordWriter::create(&local, snap.compress)?;
                for txs in &snap.tx_sets {
                    writer.write(txs)?;
                }
                writer.finalize()?;
                snap.add_file(
                    local,
                    FileCategory::Transactions.remote_checkpoint_path(checkpoint),
                );
            }
            n => {
                let idx = n - 3;
                let Some(hash) = snap.has().buckets.get(idx) else {
                    return Ok(true);
                };
                let bytes = self.buckets.read_file(hash)?;
                let local = dir.join(format!("bucket-{}.dat", hash.to_hex()));
                fs::write(&local, bytes)?;
                snap.add_file(local, FileCategory::remote_bucket_path(hash));
            }
        }
        self.cursor += 1;
        Ok(false)
    }
}

impl Work for WriteSnapshotWork {
    fn name(&self) -> &str {
        "write-snapshot"
    }

    fn status(&self) -> String {
        format!(
            "staging checkpoint {} files ({} written)",
            self.snapshot.checkpoint(),
            self.snapshot.files().len()
        )
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.snapshot.clear_files();
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        match self.write_one() {
            Ok(true) => {
                debug!(
                    checkpoint = self.snapshot.checkpoint(),
                    files = self.snapshot.files().len(),
                    "snapshot staged"
                );
                StepResult::Success
            }
            Ok(false) => StepResult::Running,
            Err(err) if err.is_transient() => StepResult::RetryableFailure(err),
            Err(err) => StepResult::FatalFailure(err),
        }
    }
}

/// Stage 3: upload every staged file to every writable archive.
///
/// One (archive, file) pair per step. Transports are required to treat
/// `store` and `make_dir` as idempotent, so a retry re-runs the whole
/// stage safely even when some uploads had already landed.
pub struct PutSnapshotFilesWork {
    snapshot: Arc<StateSnapshot>,
    archives: Vec<Archive>,
    archive_idx: usize,
    file_idx: usize,
}

impl PutSnapshotFilesWork {
    pub fn new(snapshot: Arc<StateSnapshot>, archives: Vec<Archive>) -> Self {
        PutSnapshotFilesWork {
            snapshot,
            archives,
            archive_idx: 0,
            file_idx: 0,
        }
    }
}

impl Work for PutSnapshotFilesWork {
    fn name(&self) -> &str {
        "put-snapshot-files"
    }

    fn status(&self) -> String {
        let archive = self
            .archives
            .get(self.archive_idx)
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "uploading checkpoint {} to {} ({}/{})",
            self.snapshot.checkpoint(),
            archive,
            self.file_idx,
            self.snapshot.files().len()
        )
    }

    fn reset(&mut self) {
        self.archive_idx = 0;
        self.file_idx = 0;
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        if self.archives.is_empty() {
            return StepResult::FatalFailure(ArchiveError::NoWritableArchives.into());
        }
        let Some(archive) = self.archives.get(self.archive_idx) else {
            return StepResult::Success;
        };
        let files = self.snapshot.files();
        let Some(file) = files.get(self.file_idx) else {
            // This archive is done; move to the next one.
            self.archive_idx += 1;
            self.file_idx = 0;
            if self.archive_idx >= self.archives.len() {
                info!(
                    checkpoint = self.snapshot.checkpoint(),
                    archives = self.archives.len(),
                    "checkpoint uploaded to all writable archives"
                );
                return StepResult::Success;
            }
            return StepResult::Running;
        };

        let result = archive
            .make_dir(remote_dir_of(&file.remote))
            .and_then(|()| archive.store(&file.local, &file.remote));
        match result {
            Ok(()) => {
                self.file_idx += 1;
                StepResult::Running
            }
            Err(err) if err.is_transient() => StepResult::RetryableFailure(err.into()),
            Err(err) => StepResult::FatalFailure(err.into()),
        }
    }
}

/// Assemble the full pipeline for one snapshot as a strictly ordered
/// sequence; each stage carries the caller's retry policy.
pub fn publish_sequence(
    snapshot: Arc<StateSnapshot>,
    buckets: Arc<dyn BucketStore>,
    archives: Vec<Archive>,
    retry: RetryPolicy,
) -> WorkSequence {
    WorkSequence::new(format!("publish-{:08x}", snapshot.checkpoint()))
        .push(
            Box::new(ResolveMergesWork::new(Arc::clone(&snapshot), Arc::clone(&buckets))),
            retry,
        )
        .push(
            Box::new(WriteSnapshotWork::new(Arc::clone(&snapshot), buckets)),
            retry,
        )
        .push(Box::new(PutSnapshotFilesWork::new(snapshot, archives)), retry)
}
