//! Hash-chain verification of downloaded ledger-header files.

use super::SharedHeaders;
use crate::archive::FileCategory;
use crate::error::{Error, StreamError, VerifyError};
use crate::metrics::CatchupMetrics;
use crate::stream::RecordReader;
use crate::types::LedgerHeaderHistoryEntry;
use crate::work::{StepResult, Work};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Verify the downloaded header chain across a checkpoint span, one
/// checkpoint file per step.
///
/// Within and across files every entry must carry the hash of its own
/// header, advance the sequence by exactly one, and chain its
/// `previous_ledger_hash` to the preceding entry. Where the chain touches
/// the trusted local last-closed ledger it must also agree with it. The
/// verified entries at checkpoint boundaries are published through a
/// shared map for the bucket-restore step.
pub struct VerifyLedgerChainWork {
    checkpoints: Vec<u32>,
    idx: usize,
    dir: PathBuf,
    trusted: LedgerHeaderHistoryEntry,
    prev: Option<LedgerHeaderHistoryEntry>,
    verified: SharedHeaders,
    metrics: Arc<CatchupMetrics>,
}

impl VerifyLedgerChainWork {
    pub fn new(
        checkpoints: Vec<u32>,
        dir: PathBuf,
        trusted: LedgerHeaderHistoryEntry,
        verified: SharedHeaders,
        metrics: Arc<CatchupMetrics>,
    ) -> Self {
        VerifyLedgerChainWork {
            checkpoints,
            idx: 0,
            dir,
            trusted,
            prev: None,
            verified,
            metrics,
        }
    }

    fn verify_entry(&mut self, entry: LedgerHeaderHistoryEntry) -> Result<(), VerifyError> {
        let seq = entry.seq();
        if entry.hash != entry.header.hash() {
            return Err(VerifyError::HeaderHashMismatch { seq });
        }
        match &self.prev {
            Some(prev) => {
                let expected = prev.seq() + 1;
                if seq != expected {
                    return Err(VerifyError::HeaderGap {
                        expected,
                        found: seq,
                    });
                }
                if entry.header.previous_ledger_hash != prev.hash {
                    return Err(VerifyError::ChainMismatch { seq });
                }
            }
            None => {
                // First entry of the whole span. Anchor it against local
                // state where the two meet.
                if seq == self.trusted.seq() + 1
                    && entry.header.previous_ledger_hash != self.trusted.hash
                {
                    return Err(VerifyError::TrustedLinkMismatch { seq });
                }
            }
        }
        if seq == self.trusted.seq() && entry.hash != self.trusted.hash {
            return Err(VerifyError::TrustedLinkMismatch { seq });
        }
        self.prev = Some(entry);
        Ok(())
    }

    fn verify_checkpoint(&mut self, checkpoint: u32) -> Result<(), Error> {
        let path = self
            .dir
            .join(FileCategory::Ledger.checkpoint_basename(checkpoint));
        let mut reader = RecordReader::<LedgerHeaderHistoryEntry>::open(&path)?;
        let mut saw_any = false;
        while let Some(entry) = reader.read()? {
            saw_any = true;
            self.verify_entry(entry)?;
        }
        let last_seq = self.prev.as_ref().map(|e| e.seq()).unwrap_or(0);
        if !saw_any || last_seq != checkpoint {
            return Err(VerifyError::HeaderGap {
                expected: checkpoint,
                found: last_seq,
            }
            .into());
        }
        if let Some(entry) = &self.prev {
            self.verified.lock().insert(entry.seq(), entry.clone());
        }
        Ok(())
    }
}

impl Work for VerifyLedgerChainWork {
    fn name(&self) -> &str {
        "verify-ledger-chain"
    }

    fn status(&self) -> String {
        format!(
            "verifying header chain ({}/{} checkpoints)",
            self.idx,
            self.checkpoints.len()
        )
    }

    fn reset(&mut self) {
        self.idx = 0;
        self.prev = None;
        self.verified.lock().clear();
    }

    fn step(&mut self, _now: Instant) -> StepResult {
        let Some(&checkpoint) = self.checkpoints.get(self.idx) else {
            return StepResult::Success;
        };
        match self.verify_checkpoint(checkpoint) {
            Ok(()) => {
                debug!(checkpoint, "header chain verified");
                self.metrics.ledger_chains_verified.inc();
                self.idx += 1;
                StepResult::Running
            }
            Err(Error::Stream(StreamError::Io(err))) => StepResult::RetryableFailure(err.into()),
            Err(err) => StepResult::FatalFailure(err),
        }
    }
}
