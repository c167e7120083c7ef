//! Catch-up range computation.
//!
//! Given the last locally-closed ledger, a target ledger and a replay
//! window policy, derive the exact set of ledgers to apply and the
//! checkpoint spans to verify and to apply. These computations are pure
//! and exactly reproducible: they are the cost basis for the catch-up
//! work accounting.

use crate::checkpoint::CheckpointCalculator;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive range of ledger sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRange {
    /// First ledger in the range.
    pub first: u32,

    /// Last ledger in the range, inclusive.
    pub last: u32,
}

impl LedgerRange {
    /// Create a range; `first` must not exceed `last`.
    pub fn new(first: u32, last: u32) -> Result<Self> {
        if first > last || first == 0 {
            return Err(Error::Alignment(format!(
                "invalid ledger range [{first},{last}]"
            )));
        }
        Ok(LedgerRange { first, last })
    }

    /// Number of ledgers in the range.
    pub fn count(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Whether `seq` falls inside the range.
    pub fn contains(&self, seq: u32) -> bool {
        self.first <= seq && seq <= self.last
    }

    /// Whether the range ends exactly on a checkpoint boundary.
    pub fn is_checkpoint_aligned(&self, calc: &CheckpointCalculator) -> bool {
        calc.checkpoint_containing(self.last) == self.last
    }

    /// Reject the range unless it is checkpoint-aligned and spans at most
    /// one checkpoint. Archive-facing code only ever handles such spans;
    /// anything else is a programming error surfaced before any I/O.
    pub fn ensure_single_checkpoint(&self, calc: &CheckpointCalculator) -> Result<()> {
        if !self.is_checkpoint_aligned(calc) {
            return Err(Error::Alignment(format!(
                "range [{},{}] does not end on a checkpoint boundary",
                self.first, self.last
            )));
        }
        if calc.checkpoint_containing(self.first) != self.last {
            return Err(Error::Alignment(format!(
                "range [{},{}] spans more than one checkpoint",
                self.first, self.last
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LedgerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.first, self.last)
    }
}

/// An inclusive span of checkpoint ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRange {
    first: u32,
    last: u32,
    frequency: u32,
}

impl CheckpointRange {
    /// The checkpoint span covering a ledger range.
    pub fn covering(range: LedgerRange, calc: &CheckpointCalculator) -> Self {
        CheckpointRange {
            first: calc.checkpoint_containing(range.first),
            last: calc.checkpoint_containing(range.last),
            frequency: calc.frequency(),
        }
    }

    /// First checkpoint in the span.
    pub fn first(&self) -> u32 {
        self.first
    }

    /// Last checkpoint in the span, inclusive.
    pub fn last(&self) -> u32 {
        self.last
    }

    /// Number of checkpoints in the span. Both endpoints are included;
    /// a span whose endpoints coincide counts exactly one checkpoint.
    pub fn count(&self) -> u32 {
        (self.last - self.first) / self.frequency + 1
    }

    /// Iterate the checkpoint ledgers in ascending order.
    pub fn checkpoints(&self) -> impl Iterator<Item = u32> {
        (self.first..=self.last).step_by(self.frequency as usize)
    }

    /// The same span extended one checkpoint earlier, when an earlier
    /// checkpoint exists. Used to establish hash-chain linkage for a
    /// bucket-restored starting state.
    pub fn extended_earlier(&self) -> Self {
        if self.first >= self.frequency * 2 - 1 {
            CheckpointRange {
                first: self.first - self.frequency,
                ..*self
            }
        } else {
            *self
        }
    }
}

impl fmt::Display for CheckpointRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.first, self.last)
    }
}

/// How much recent history to replay during catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Replay every transaction from the last locally-known state.
    Complete,

    /// Replay only the last `n` ledgers, restoring earlier state from
    /// state-store buckets.
    Recent(u32),
}

/// The derived plan for one catch-up: which ledgers to apply, and whether
/// state-store bucket restoration is required first. Derived, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupRange {
    /// Ledgers whose transactions will be replayed.
    pub apply: LedgerRange,

    /// Whether state must be restored from buckets to reach the ledger
    /// immediately before `apply.first`.
    pub apply_buckets: bool,
}

impl CatchupRange {
    /// Compute the catch-up plan.
    ///
    /// If the target is within the replay window of the last closed
    /// ledger, or the policy requests full replay, everything from
    /// `last_closed + 1` is replayed with no bucket restoration.
    /// Otherwise the apply range begins at the start of the replay window
    /// ending at the target, and buckets restore the state immediately
    /// before it.
    pub fn compute(
        last_closed: u32,
        target: u32,
        policy: ReplayPolicy,
        _calc: &CheckpointCalculator,
    ) -> Result<Self> {
        if target <= last_closed {
            return Err(Error::Alignment(format!(
                "catchup target {target} is not ahead of last closed ledger {last_closed}"
            )));
        }
        match policy {
            ReplayPolicy::Complete => Ok(CatchupRange {
                apply: LedgerRange::new(last_closed + 1, target)?,
                apply_buckets: false,
            }),
            ReplayPolicy::Recent(n) => {
                let window_first = target.saturating_sub(n).saturating_add(1);
                if window_first <= last_closed + 1 {
                    // Replay window already covers local state; no restore.
                    Ok(CatchupRange {
                        apply: LedgerRange::new(last_closed + 1, target)?,
                        apply_buckets: false,
                    })
                } else {
                    Ok(CatchupRange {
                        apply: LedgerRange::new(window_first, target)?,
                        apply_buckets: true,
                    })
                }
            }
        }
    }

    /// Checkpoint span for the verify phase: the apply range's
    /// checkpoints, extended one checkpoint earlier when bucket
    /// restoration must chain from an earlier recorded hash.
    pub fn verify_range(&self, calc: &CheckpointCalculator) -> CheckpointRange {
        let apply = CheckpointRange::covering(self.apply, calc);
        if self.apply_buckets {
            apply.extended_earlier()
        } else {
            apply
        }
    }

    /// Checkpoint span for the apply phase.
    pub fn apply_checkpoint_range(&self, calc: &CheckpointCalculator) -> CheckpointRange {
        CheckpointRange::covering(self.apply, calc)
    }

    /// Exact number of history-archive-state fetches this plan costs:
    /// one, plus one more when bucket restoration is needed and the
    /// verify and apply checkpoint spans differ.
    pub fn archive_state_fetches(&self, calc: &CheckpointCalculator) -> u64 {
        let mut fetches = 1;
        if self.apply_buckets && self.verify_range(calc) != self.apply_checkpoint_range(calc) {
            fetches += 1;
        }
        fetches
    }
}
