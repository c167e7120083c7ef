//! Catch-up: replaying archived history to advance local state.
//!
//! A catch-up to a target ledger runs as one strictly ordered work
//! sequence:
//!
//! 1. fetch the snapshot descriptor at the target's checkpoint (and, for
//!    a bucket-restored catch-up, the descriptor at the restore
//!    checkpoint),
//! 2. download the ledger-header files of the verify span and verify
//!    their hash chain against the trusted local last-closed ledger,
//! 3. for a bucket-restored catch-up, download the restore descriptor's
//!    missing bucket files, restore state from them and adopt the
//!    verified header at the restore checkpoint,
//! 4. download the transaction files of the apply span and replay them
//!    one ledger at a time, checking every replayed ledger against the
//!    verified chain.
//!
//! Every download step is retried with backoff; every verification
//! failure is fatal and leaves local state behind the target but intact.

mod apply;
mod download;
mod verify;

pub use apply::{ApplyBucketsWork, ApplyCheckpointWork};
pub use download::{DownloadBucketsWork, DownloadCheckpointFilesWork, GetHistoryArchiveStateWork};
pub use verify::VerifyLedgerChainWork;

use crate::archive::{Archive, FileCategory, HistoryArchiveState};
use crate::bucket::BucketStore;
use crate::checkpoint::CheckpointCalculator;
use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerApplier;
use crate::metrics::{CatchupMetrics, HistoryMetrics};
use crate::range::{CatchupRange, ReplayPolicy};
use crate::types::LedgerHeaderHistoryEntry;
use crate::work::WorkSequence;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Slot a fetched snapshot descriptor is delivered through, shared
/// between the fetch step and its consumers.
pub type SharedHas = Arc<Mutex<Option<HistoryArchiveState>>>;

/// Verified header entries at checkpoint boundaries, filled by the verify
/// step and consumed by bucket restoration.
pub type SharedHeaders = Arc<Mutex<HashMap<u32, LedgerHeaderHistoryEntry>>>;

/// Collaborators a catch-up runs against.
pub struct CatchupContext {
    pub config: HistoryConfig,
    pub archives: Vec<Archive>,
    pub buckets: Arc<dyn BucketStore>,
    pub applier: Arc<dyn LedgerApplier>,
    pub history_metrics: Arc<HistoryMetrics>,
    pub metrics: Arc<CatchupMetrics>,
}

impl CatchupContext {
    fn download_dir(&self) -> PathBuf {
        self.config.staging_dir.join("catchup")
    }
}

/// Plan a catch-up from the applier's current last-closed ledger to
/// `target` and assemble it as a runnable work sequence.
///
/// Fails before any I/O when the target is not ahead of local state, or
/// when a bucket-restored plan has no earlier archived checkpoint to
/// restore from.
pub fn catchup_sequence(
    ctx: &CatchupContext,
    target: u32,
    policy: ReplayPolicy,
) -> Result<WorkSequence> {
    let calc = CheckpointCalculator::new(ctx.config.checkpoint_frequency);
    let trusted = ctx.applier.last_closed();
    let range = CatchupRange::compute(trusted.seq(), target, policy, &calc)?;
    let verify = range.verify_range(&calc);
    let apply_cps = range.apply_checkpoint_range(&calc);

    if range.apply_buckets && verify == apply_cps {
        // The replay window begins inside the very first checkpoint, so
        // there is no earlier archived state to restore. A complete replay
        // from local state covers the same ledgers.
        return Err(Error::Alignment(format!(
            "replay window starting at {} has no earlier checkpoint to restore from",
            range.apply.first
        )));
    }

    info!(
        target,
        ?policy,
        apply = %range.apply,
        apply_buckets = range.apply_buckets,
        verify = %verify,
        "planned catchup"
    );

    let dir = ctx.download_dir();
    let retry = ctx.config.retry;
    let target_cp = calc.checkpoint_containing(target);

    let target_has: SharedHas = Arc::default();
    let mut seq = WorkSequence::new(format!("catchup-to-{target}")).push(
        Box::new(GetHistoryArchiveStateWork::new(
            target_cp,
            ctx.archives.clone(),
            dir.clone(),
            Arc::clone(&target_has),
            Arc::clone(&ctx.metrics),
        )),
        retry,
    );

    let restore_has: SharedHas = Arc::default();
    if range.apply_buckets {
        seq = seq.push(
            Box::new(GetHistoryArchiveStateWork::new(
                verify.first(),
                ctx.archives.clone(),
                dir.clone(),
                Arc::clone(&restore_has),
                Arc::clone(&ctx.metrics),
            )),
            retry,
        );
    }

    seq = seq.push(
        Box::new(DownloadCheckpointFilesWork::new(
            FileCategory::Ledger,
            verify.checkpoints().collect(),
            ctx.archives.clone(),
            dir.clone(),
            Arc::clone(&ctx.metrics),
        )),
        retry,
    );

    let verified: SharedHeaders = Arc::default();
    seq = seq.push(
        Box::new(VerifyLedgerChainWork::new(
            verify.checkpoints().collect(),
            dir.clone(),
            trusted,
            Arc::clone(&verified),
            Arc::clone(&ctx.metrics),
        )),
        retry,
    );

    if range.apply_buckets {
        seq = seq
            .push(
                Box::new(DownloadBucketsWork::new(
                    Arc::clone(&restore_has),
                    Arc::clone(&ctx.buckets),
                    ctx.archives.clone(),
                    dir.clone(),
                    Arc::clone(&ctx.metrics),
                )),
                retry,
            )
            .push(
                Box::new(ApplyBucketsWork::new(
                    restore_has,
                    Arc::clone(&ctx.buckets),
                    Arc::clone(&ctx.applier),
                    Arc::clone(&verified),
                    verify.first(),
                    Arc::clone(&ctx.metrics),
                )),
                retry,
            );
    }

    seq = seq
        .push(
            Box::new(DownloadCheckpointFilesWork::new(
                FileCategory::Transactions,
                apply_cps.checkpoints().collect(),
                ctx.archives.clone(),
                dir.clone(),
                Arc::clone(&ctx.metrics),
            )),
            retry,
        )
        .push(
            Box::new(ApplyCheckpointWork::new(
                apply_cps.checkpoints().collect(),
                range.apply.last,
                dir,
                Arc::clone(&ctx.applier),
                Arc::clone(&ctx.history_metrics),
                Arc::clone(&ctx.metrics),
            )),
            retry,
        );

    Ok(seq)
}
