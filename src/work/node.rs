//! Retry lifecycle wrapper around one work item.

use super::{RetryPolicy, StepResult, Work, WorkState};
use crate::error::Error;
use std::time::Instant;
use tracing::{debug, warn};

/// A scheduled work item together with its lifecycle state, retry
/// bookkeeping and wake deadline. The scheduler cranks nodes; the node
/// decides whether its item actually steps.
pub struct WorkNode {
    work: Box<dyn Work>,
    state: WorkState,
    attempts: u32,
    retry: RetryPolicy,
    wake_at: Option<Instant>,
    last_error: Option<Error>,
}

impl WorkNode {
    /// Wrap a work item with a retry policy.
    pub fn new(work: Box<dyn Work>, retry: RetryPolicy) -> Self {
        WorkNode {
            work,
            state: WorkState::Pending,
            attempts: 0,
            retry,
            wake_at: None,
            last_error: None,
        }
    }

    /// The wrapped item's name.
    pub fn name(&self) -> &str {
        self.work.name()
    }

    /// Progress line, prefixed with the lifecycle state.
    pub fn status(&self) -> String {
        format!("{}: {}", self.state, self.work.status())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkState {
        self.state
    }

    /// Whether the node will never step again.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Deadline before which cranking is a no-op, if one is set.
    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    /// Take the error that finished or is retrying this node.
    pub fn take_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    /// Request a cooperative abort. Terminal nodes are unaffected; all
    /// others unwind on subsequent cranks.
    pub fn request_abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = WorkState::Aborting;
            self.wake_at = None;
        }
    }

    /// Abort synchronously if the item can release immediately.
    /// Returns `true` when the node reached `Aborted`.
    pub fn abort_now(&mut self) -> bool {
        match self.state {
            WorkState::Success | WorkState::Failure | WorkState::Aborted => true,
            _ => {
                if self.work.abort() {
                    self.state = WorkState::Aborted;
                    true
                } else {
                    self.state = WorkState::Aborting;
                    false
                }
            }
        }
    }

    /// Drive the lifecycle one crank. Steps the item when it is runnable
    /// and `now` has passed any wake deadline, and applies the step's
    /// outcome to the lifecycle state.
    pub fn crank(&mut self, now: Instant) {
        match self.state {
            WorkState::Success | WorkState::Failure | WorkState::Aborted => return,
            WorkState::Aborting => {
                if self.work.abort() {
                    debug!(work = self.work.name(), "work aborted");
                    self.state = WorkState::Aborted;
                }
                return;
            }
            WorkState::Pending => {
                self.state = WorkState::Running;
            }
            WorkState::Running | WorkState::Waiting => {
                if let Some(wake) = self.wake_at {
                    if now < wake {
                        return;
                    }
                    self.wake_at = None;
                }
            }
            WorkState::Retrying => {
                match self.wake_at {
                    Some(wake) if now < wake => return,
                    _ => {}
                }
                self.wake_at = None;
                self.work.reset();
                self.state = WorkState::Running;
            }
        }

        match self.work.step(now) {
            StepResult::Running => {
                self.state = WorkState::Running;
            }
            StepResult::Waiting => {
                self.state = WorkState::Waiting;
            }
            StepResult::WaitUntil(deadline) => {
                self.state = WorkState::Waiting;
                self.wake_at = Some(deadline);
            }
            StepResult::Success => {
                debug!(work = self.work.name(), "work succeeded");
                self.state = WorkState::Success;
            }
            StepResult::RetryableFailure(err) => {
                self.attempts += 1;
                if self.attempts >= self.retry.max_attempts {
                    warn!(
                        work = self.work.name(),
                        attempts = self.attempts,
                        error = %err,
                        "work failed after exhausting retries"
                    );
                    self.last_error = Some(err);
                    self.state = WorkState::Failure;
                } else {
                    let delay = self.retry.delay(self.attempts - 1);
                    debug!(
                        work = self.work.name(),
                        attempt = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "work failed transiently; backing off"
                    );
                    self.last_error = Some(err);
                    self.wake_at = Some(now + delay);
                    self.state = WorkState::Retrying;
                }
            }
            StepResult::FatalFailure(err) => {
                warn!(work = self.work.name(), error = %err, "work failed");
                self.last_error = Some(err);
                self.state = WorkState::Failure;
            }
        }
    }
}

impl std::fmt::Debug for WorkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkNode")
            .field("name", &self.work.name())
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ArchiveError, Error};
    use std::time::Duration;

    struct FlakyWork {
        failures_left: u32,
        steps_after_recovery: u32,
        resets: u32,
    }

    impl Work for FlakyWork {
        fn name(&self) -> &str {
            "flaky"
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn step(&mut self, _now: Instant) -> StepResult {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return StepResult::RetryableFailure(
                    ArchiveError::Unreachable {
                        name: "test".into(),
                        reason: "down".into(),
                    }
                    .into(),
                );
            }
            if self.steps_after_recovery > 0 {
                self.steps_after_recovery -= 1;
                return StepResult::Running;
            }
            StepResult::Success
        }
    }

    #[test]
    fn test_retry_then_succeed_with_backoff() {
        let start = Instant::now();
        let retry = RetryPolicy::default()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(8));
        let mut node = WorkNode::new(
            Box::new(FlakyWork {
                failures_left: 2,
                steps_after_recovery: 1,
                resets: 0,
            }),
            retry,
        );

        // First crank fails; node backs off one second.
        node.crank(start);
        assert_eq!(node.state(), WorkState::Retrying);
        assert_eq!(node.wake_at(), Some(start + Duration::from_secs(1)));

        // Cranking before the deadline is a no-op.
        node.crank(start + Duration::from_millis(500));
        assert_eq!(node.state(), WorkState::Retrying);

        // Second failure doubles the delay.
        node.crank(start + Duration::from_secs(1));
        assert_eq!(node.state(), WorkState::Retrying);
        assert_eq!(node.wake_at(), Some(start + Duration::from_secs(3)));

        // Recovered: one running step, then success.
        node.crank(start + Duration::from_secs(3));
        assert_eq!(node.state(), WorkState::Running);
        node.crank(start + Duration::from_secs(3));
        assert_eq!(node.state(), WorkState::Success);
    }

    #[test]
    fn test_reset_called_before_each_rerun() {
        let start = Instant::now();
        let mut node = WorkNode::new(
            Box::new(FlakyWork {
                failures_left: 2,
                steps_after_recovery: 0,
                resets: 0,
            }),
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
        );
        node.crank(start);
        node.crank(start + Duration::from_secs(1));
        node.crank(start + Duration::from_secs(2));
        assert_eq!(node.state(), WorkState::Success);
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let start = Instant::now();
        let mut node = WorkNode::new(
            Box::new(FlakyWork {
                failures_left: 10,
                steps_after_recovery: 0,
                resets: 0,
            }),
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1)),
        );
        node.crank(start);
        assert_eq!(node.state(), WorkState::Retrying);
        node.crank(start + Duration::from_secs(1));
        assert_eq!(node.state(), WorkState::Failure);
        assert!(node.take_error().is_some());
    }

    struct FatalWork;

    impl Work for FatalWork {
        fn name(&self) -> &str {
            "fatal"
        }

        fn step(&mut self, _now: Instant) -> StepResult {
            StepResult::FatalFailure(Error::Alignment("bad range".into()))
        }
    }

    #[test]
    fn test_fatal_failure_is_not_retried() {
        let mut node = WorkNode::new(Box::new(FatalWork), RetryPolicy::default());
        node.crank(Instant::now());
        assert_eq!(node.state(), WorkState::Failure);
    }

    struct SlowAbortWork {
        abort_cranks_needed: u32,
    }

    impl Work for SlowAbortWork {
        fn name(&self) -> &str {
            "slow-abort"
        }

        fn step(&mut self, _now: Instant) -> StepResult {
            StepResult::Running
        }

        fn abort(&mut self) -> bool {
            if self.abort_cranks_needed > 0 {
                self.abort_cranks_needed -= 1;
                return false;
            }
            true
        }
    }

    #[test]
    fn test_cooperative_abort_unwinds_over_cranks() {
        let start = Instant::now();
        let mut node = WorkNode::new(
            Box::new(SlowAbortWork {
                abort_cranks_needed: 2,
            }),
            RetryPolicy::default(),
        );
        node.crank(start);
        assert_eq!(node.state(), WorkState::Running);

        node.request_abort();
        assert_eq!(node.state(), WorkState::Aborting);
        node.crank(start);
        assert_eq!(node.state(), WorkState::Aborting);
        node.crank(start);
        assert_eq!(node.state(), WorkState::Aborting);
        node.crank(start);
        assert_eq!(node.state(), WorkState::Aborted);
    }
}
