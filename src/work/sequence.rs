//! Strictly ordered composition of work items.

use super::{RetryPolicy, StepResult, Work, WorkNode};
use crate::error::Error;
use std::time::Instant;

/// Runs child work items strictly in order: child N+1 is never stepped
/// until child N has succeeded. A child failure (after its own retries)
/// fails the whole sequence and skips the remaining children; an abort
/// unwinds the currently running child and skips the rest.
pub struct WorkSequence {
    name: String,
    children: Vec<WorkNode>,
    current: usize,
}

impl WorkSequence {
    /// Create an empty sequence.
    pub fn new(name: impl Into<String>) -> Self {
        WorkSequence {
            name: name.into(),
            children: Vec::new(),
            current: 0,
        }
    }

    /// Append a child with its own retry policy.
    pub fn push(mut self, work: Box<dyn Work>, retry: RetryPolicy) -> Self {
        self.children.push(WorkNode::new(work, retry));
        self
    }

    /// Index of the child currently being driven.
    pub fn current_index(&self) -> usize {
        self.current
    }
}

impl Work for WorkSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> String {
        match self.children.get(self.current) {
            Some(child) => format!(
                "{} [{}/{}] {}",
                self.name,
                self.current + 1,
                self.children.len(),
                child.status()
            ),
            None => format!("{} [done]", self.name),
        }
    }

    fn reset(&mut self) {
        // A sequence retried from outside starts over from its first child.
        self.current = 0;
    }

    fn step(&mut self, now: Instant) -> StepResult {
        loop {
            let Some(child) = self.children.get_mut(self.current) else {
                return StepResult::Success;
            };
            child.crank(now);
            match child.state() {
                super::WorkState::Success => {
                    self.current += 1;
                    // Move straight on; the next child is cranked on the
                    // next iteration of this same step.
                }
                super::WorkState::Failure => {
                    let err = child
                        .take_error()
                        .unwrap_or_else(|| Error::Apply(format!("{} failed", child.name())));
                    return StepResult::FatalFailure(err);
                }
                super::WorkState::Aborted => {
                    return StepResult::FatalFailure(Error::Aborted);
                }
                super::WorkState::Waiting | super::WorkState::Retrying => {
                    return match child.wake_at() {
                        Some(deadline) => StepResult::WaitUntil(deadline),
                        None => StepResult::Waiting,
                    };
                }
                _ => return StepResult::Running,
            }
        }
    }

    fn abort(&mut self) -> bool {
        match self.children.get_mut(self.current) {
            Some(child) => child.abort_now(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkState;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingWork {
        tag: &'static str,
        steps_needed: u32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Work for RecordingWork {
        fn name(&self) -> &str {
            self.tag
        }

        fn step(&mut self, _now: Instant) -> StepResult {
            self.log.lock().push(self.tag);
            if self.steps_needed > 1 {
                self.steps_needed -= 1;
                StepResult::Running
            } else {
                StepResult::Success
            }
        }
    }

    #[test]
    fn test_children_run_strictly_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seq = WorkSequence::new("pipeline")
            .push(
                Box::new(RecordingWork {
                    tag: "first",
                    steps_needed: 2,
                    log: Arc::clone(&log),
                }),
                RetryPolicy::no_retries(),
            )
            .push(
                Box::new(RecordingWork {
                    tag: "second",
                    steps_needed: 1,
                    log: Arc::clone(&log),
                }),
                RetryPolicy::no_retries(),
            );

        let mut node = WorkNode::new(Box::new(seq), RetryPolicy::no_retries());
        let now = Instant::now();
        while !node.is_terminal() {
            node.crank(now);
        }
        assert_eq!(node.state(), WorkState::Success);
        assert_eq!(*log.lock(), vec!["first", "first", "second"]);
    }

    struct FailingWork;

    impl Work for FailingWork {
        fn name(&self) -> &str {
            "failing"
        }

        fn step(&mut self, _now: Instant) -> StepResult {
            StepResult::FatalFailure(Error::Apply("boom".into()))
        }
    }

    #[test]
    fn test_child_failure_skips_remaining_children() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seq = WorkSequence::new("pipeline")
            .push(Box::new(FailingWork), RetryPolicy::no_retries())
            .push(
                Box::new(RecordingWork {
                    tag: "never",
                    steps_needed: 1,
                    log: Arc::clone(&log),
                }),
                RetryPolicy::no_retries(),
            );

        let mut node = WorkNode::new(Box::new(seq), RetryPolicy::no_retries());
        let now = Instant::now();
        while !node.is_terminal() {
            node.crank(now);
        }
        assert_eq!(node.state(), WorkState::Failure);
        assert!(log.lock().is_empty());
    }
}
