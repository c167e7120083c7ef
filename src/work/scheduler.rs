//! Single-threaded crank loop over root work items.

use super::{RetryPolicy, Work, WorkNode, WorkState};
use std::time::{Duration, Instant};
use tracing::trace;

/// Safety bound on `run_to_completion` cranks; hitting it means a work
/// item is waiting on an event that will never arrive.
const MAX_CRANKS: u32 = 1_000_000;

/// Owns root work items and cranks each runnable one once per call.
///
/// The scheduler is entirely passive: time is a parameter, so callers can
/// drive it from a real event loop with `Instant::now()` or from tests
/// with virtual time, and backoff behavior stays deterministic.
#[derive(Default)]
pub struct WorkScheduler {
    roots: Vec<WorkNode>,
}

impl WorkScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root work item; returns its handle index.
    pub fn add(&mut self, work: Box<dyn Work>, retry: RetryPolicy) -> usize {
        self.roots.push(WorkNode::new(work, retry));
        self.roots.len() - 1
    }

    /// Crank every non-terminal root once.
    pub fn crank(&mut self, now: Instant) {
        for node in &mut self.roots {
            if !node.is_terminal() {
                trace!(work = node.name(), state = %node.state(), "cranking");
                node.crank(now);
            }
        }
    }

    /// The earliest wake deadline over all non-terminal roots, if any root
    /// is sleeping on one.
    pub fn next_wake(&self) -> Option<Instant> {
        self.roots
            .iter()
            .filter(|n| !n.is_terminal())
            .filter_map(|n| n.wake_at())
            .min()
    }

    /// Whether every root has reached a terminal state.
    pub fn all_done(&self) -> bool {
        self.roots.iter().all(|n| n.is_terminal())
    }

    /// State of the root at `index`.
    pub fn state_of(&self, index: usize) -> Option<WorkState> {
        self.roots.get(index).map(|n| n.state())
    }

    /// Status line of the root at `index`.
    pub fn status_of(&self, index: usize) -> Option<String> {
        self.roots.get(index).map(|n| n.status())
    }

    /// Take the error of the root at `index`.
    pub fn take_error(&mut self, index: usize) -> Option<crate::error::Error> {
        self.roots.get_mut(index).and_then(|n| n.take_error())
    }

    /// Request abort of every non-terminal root.
    pub fn abort_all(&mut self) {
        for node in &mut self.roots {
            node.request_abort();
        }
    }

    /// Drop terminal roots, returning their final states.
    pub fn reap(&mut self) -> Vec<WorkState> {
        let mut finished = Vec::new();
        self.roots.retain_mut(|node| {
            if node.is_terminal() {
                finished.push(node.state());
                false
            } else {
                true
            }
        });
        finished
    }

    /// Crank with virtual time until every root is terminal. Time starts
    /// at `start` and jumps to the earliest wake deadline whenever all
    /// runnable work is sleeping. Returns the final virtual time, or
    /// `None` if progress stalled on an external event.
    pub fn run_to_completion(&mut self, start: Instant) -> Option<Instant> {
        let mut now = start;
        for _ in 0..MAX_CRANKS {
            if self.all_done() {
                return Some(now);
            }
            self.crank(now);
            if let Some(wake) = self.next_wake() {
                if wake > now {
                    now = wake;
                }
            } else {
                // No deadline pending; nudge time so polling loops that
                // compare against deadlines still advance.
                now += Duration::from_millis(1);
            }
        }
        None
    }
}
