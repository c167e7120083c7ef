//! Checkpoint boundary arithmetic.
//!
//! History is archived and fetched only in checkpoint-aligned batches.
//! With frequency F, checkpoint boundaries are the ledgers `F-1`, `2F-1`,
//! `3F-1`, ...: the checkpoint ledger is the *last* ledger included in its
//! batch. All operations here are pure, total functions of the frequency
//! and a ledger sequence.

use crate::config::{ACCELERATED_CHECKPOINT_FREQUENCY, DEFAULT_CHECKPOINT_FREQUENCY};
use crate::types::GENESIS_SEQ;

/// Maps ledger sequence numbers to checkpoint boundaries for a configured
/// frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCalculator {
    frequency: u32,
}

impl CheckpointCalculator {
    /// Create a calculator for the given frequency. The frequency must be
    /// positive; production uses [`DEFAULT_CHECKPOINT_FREQUENCY`].
    pub fn new(frequency: u32) -> Self {
        assert!(frequency > 0, "checkpoint frequency must be positive");
        CheckpointCalculator { frequency }
    }

    /// Calculator with the production frequency of 64.
    pub fn production() -> Self {
        Self::new(DEFAULT_CHECKPOINT_FREQUENCY)
    }

    /// Calculator with the reduced frequency used for accelerated tests.
    pub fn accelerated() -> Self {
        Self::new(ACCELERATED_CHECKPOINT_FREQUENCY)
    }

    /// The configured checkpoint frequency.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// The checkpoint ledger whose batch contains `ledger`: the smallest
    /// checkpoint boundary >= `ledger`. Intermediate arithmetic is done
    /// in u64 and the result saturates at `u32::MAX`, so sequences near
    /// the top of the domain stay total.
    pub fn checkpoint_containing(&self, ledger: u32) -> u32 {
        let freq = u64::from(self.frequency);
        let next = (u64::from(ledger) + 1).div_ceil(freq) * freq;
        clamp_seq(next - 1)
    }

    /// The largest multiple of the frequency <= `ledger`.
    pub fn prev_checkpoint(&self, ledger: u32) -> u32 {
        (ledger / self.frequency) * self.frequency
    }

    /// The smallest positive multiple of the frequency >= `ledger`,
    /// saturating at `u32::MAX`.
    pub fn next_checkpoint(&self, ledger: u32) -> u32 {
        if ledger == 0 {
            return self.frequency;
        }
        let freq = u64::from(self.frequency);
        clamp_seq(u64::from(ledger).div_ceil(freq) * freq)
    }

    /// Whether `ledger` is itself a checkpoint boundary.
    pub fn is_checkpoint(&self, ledger: u32) -> bool {
        self.checkpoint_containing(ledger) == ledger
    }

    /// Whether `ledger` is the first ledger of a fresh checkpoint batch,
    /// i.e. the ledger immediately after a boundary. This is the moment a
    /// node queues the previous checkpoint for publication.
    pub fn is_first_in_checkpoint(&self, ledger: u32) -> bool {
        ledger == self.next_checkpoint(ledger)
    }

    /// The first ledger included in the batch ending at `checkpoint`.
    /// The first batch starts at the genesis ledger rather than ledger 0.
    pub fn first_ledger_in_checkpoint(&self, checkpoint: u32) -> u32 {
        debug_assert!(self.is_checkpoint(checkpoint));
        if checkpoint < self.frequency {
            GENESIS_SEQ
        } else {
            checkpoint + 1 - self.frequency
        }
    }

    /// The inclusive ledger span of the batch ending at `checkpoint`.
    pub fn checkpoint_span(&self, checkpoint: u32) -> (u32, u32) {
        (self.first_ledger_in_checkpoint(checkpoint), checkpoint)
    }
}

fn clamp_seq(seq: u64) -> u32 {
    seq.min(u64::from(u32::MAX)) as u32
}
