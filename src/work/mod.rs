//! Cooperative work scheduling.
//!
//! Long-running history operations (publication pipelines, catch-up) are
//! decomposed into `Work` items that make one bounded unit of progress per
//! `step` call. A single-threaded [`WorkScheduler`](scheduler::WorkScheduler)
//! cranks them in turn, so all state transitions happen on the caller's
//! thread and no history state needs locking against concurrent steps.
//! Blocking operations (background merges) are observed through pollable
//! handles rather than awaited.
//!
//! Each item is wrapped in a [`WorkNode`](node::WorkNode) that drives its
//! retry lifecycle: transient failures reset the item and re-run it after
//! exponential backoff, fatal failures finish it immediately.

mod node;
mod scheduler;
mod sequence;

pub use node::WorkNode;
pub use scheduler::WorkScheduler;
pub use sequence::WorkSequence;

use crate::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of a scheduled work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Added to the scheduler, not yet stepped.
    Pending,
    /// Actively making progress.
    Running,
    /// Blocked on an external event or a deadline.
    Waiting,
    /// Failed transiently; will reset and re-run after backoff.
    Retrying,
    /// Finished successfully. Terminal.
    Success,
    /// Failed fatally or exhausted its retries. Terminal.
    Failure,
    /// Abort requested; the item is unwinding.
    Aborting,
    /// Abort complete. Terminal.
    Aborted,
}

impl WorkState {
    /// Whether the item will never be stepped again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Success | WorkState::Failure | WorkState::Aborted
        )
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkState::Pending => "PENDING",
            WorkState::Running => "RUNNING",
            WorkState::Waiting => "WAITING",
            WorkState::Retrying => "RETRYING",
            WorkState::Success => "SUCCESS",
            WorkState::Failure => "FAILURE",
            WorkState::Aborting => "ABORTING",
            WorkState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Outcome of one `step` call.
#[derive(Debug)]
pub enum StepResult {
    /// Progress was made; step again on the next crank.
    Running,
    /// Blocked on an external event; poll again on the next crank.
    Waiting,
    /// Blocked until a deadline.
    WaitUntil(Instant),
    /// The item is done.
    Success,
    /// The step failed in a way that may succeed on a re-run.
    RetryableFailure(Error),
    /// The step failed permanently.
    FatalFailure(Error),
}

/// One unit of schedulable work.
///
/// `step` must do a bounded amount of work and return; the scheduler owns
/// the loop. Items that spawn logical sub-steps keep their own cursor and
/// report `Running` until the last sub-step completes.
pub trait Work: Send {
    /// Stable name for logs and status lines.
    fn name(&self) -> &str;

    /// Human-readable progress line.
    fn status(&self) -> String {
        self.name().to_string()
    }

    /// Discard partial progress before a retry re-run. Work items whose
    /// steps are idempotent need not override this.
    fn reset(&mut self) {}

    /// Make one unit of progress.
    fn step(&mut self, now: Instant) -> StepResult;

    /// Begin aborting. Returns `true` when the item has released its
    /// resources and is fully aborted; items that need further cranks to
    /// unwind return `false` and are stepped again via `abort`.
    fn abort(&mut self) -> bool {
        true
    }
}

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before the item fails permanently.
    pub max_attempts: u32,
    /// Delay before the first re-run; doubles per subsequent attempt.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never re-runs.
    pub fn no_retries() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial backoff delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the backoff ceiling.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff delay after the given zero-based failed attempt.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkState::Success.is_terminal());
        assert!(WorkState::Failure.is_terminal());
        assert!(WorkState::Aborted.is_terminal());
        assert!(!WorkState::Retrying.is_terminal());
        assert!(!WorkState::Aborting.is_terminal());
    }
}
