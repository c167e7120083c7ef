//! The history manager: the node-facing facade over publication and
//! catch-up.
//!
//! The manager owns the durable publish queue, at most one in-flight
//! publication pipeline, and a scheduler for catch-up runs. Everything is
//! driven from the node's main loop through [`HistoryManager::drive`];
//! the manager never spawns threads of its own.

use crate::archive::{Archive, HistoryArchiveState};
use crate::bucket::BucketStore;
use crate::catchup::{catchup_sequence, CatchupContext};
use crate::checkpoint::CheckpointCalculator;
use crate::config::HistoryConfig;
use crate::error::Result;
use crate::ledger::{HistorySource, LedgerApplier};
use crate::metrics::{CatchupMetrics, HistoryMetrics};
use crate::publish::{publish_sequence, StateSnapshot};
use crate::queue::{PublishQueue, QueueStore};
use crate::range::{LedgerRange, ReplayPolicy};
use crate::types::Hash256;
use crate::work::{RetryPolicy, WorkNode, WorkScheduler, WorkState};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

struct ActivePublish {
    node: WorkNode,
    snapshot: Arc<StateSnapshot>,
}

/// Facade over history publication and catch-up for one node.
pub struct HistoryManager {
    config: HistoryConfig,
    calc: CheckpointCalculator,
    queue: PublishQueue,
    archives: Vec<Archive>,
    buckets: Arc<dyn BucketStore>,
    source: Arc<dyn HistorySource>,
    applier: Arc<dyn LedgerApplier>,
    metrics: Arc<HistoryMetrics>,
    catchup_metrics: Arc<CatchupMetrics>,
    scheduler: WorkScheduler,
    active: Option<ActivePublish>,
    publication_enabled: bool,
}

impl HistoryManager {
    /// Assemble a manager over its collaborators, reloading any queued
    /// snapshots from the durable store.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HistoryConfig,
        store: Box<dyn QueueStore>,
        archives: Vec<Archive>,
        buckets: Arc<dyn BucketStore>,
        source: Arc<dyn HistorySource>,
        applier: Arc<dyn LedgerApplier>,
        metrics: Arc<HistoryMetrics>,
        catchup_metrics: Arc<CatchupMetrics>,
    ) -> Result<Self> {
        let calc = CheckpointCalculator::new(config.checkpoint_frequency);
        let queue = PublishQueue::open(store, Arc::clone(&metrics))?;
        Ok(HistoryManager {
            config,
            calc,
            queue,
            archives,
            buckets,
            source,
            applier,
            metrics,
            catchup_metrics,
            scheduler: WorkScheduler::new(),
            active: None,
            publication_enabled: true,
        })
    }

    /// The manager's checkpoint calculator.
    pub fn calculator(&self) -> &CheckpointCalculator {
        &self.calc
    }

    /// The publication metrics registry.
    pub fn metrics(&self) -> &Arc<HistoryMetrics> {
        &self.metrics
    }

    /// The catch-up metrics registry.
    pub fn catchup_metrics(&self) -> &Arc<CatchupMetrics> {
        &self.catchup_metrics
    }

    /// Enable or disable publication. While disabled, checkpoints still
    /// queue durably; no pipeline starts.
    pub fn set_publication_enabled(&mut self, enabled: bool) {
        self.publication_enabled = enabled;
    }

    /// Called after each ledger close. When `closed_seq` is the first
    /// ledger of a fresh checkpoint batch, the just-completed checkpoint
    /// is durably queued and publication is kicked. Returns whether a
    /// checkpoint was queued.
    pub fn maybe_queue_checkpoint(&mut self, closed_seq: u32) -> Result<bool> {
        if !self.calc.is_first_in_checkpoint(closed_seq) {
            return Ok(false);
        }
        if !self.archives.iter().any(|a| a.writable()) {
            warn!(
                checkpoint = closed_seq - 1,
                "no writable history archives configured; skipping checkpoint publication"
            );
            return Ok(false);
        }
        self.queue_current_history(closed_seq - 1)?;
        self.publish_queued_history()?;
        Ok(true)
    }

    /// Durably queue the snapshot descriptor for `checkpoint`, built from
    /// the state store's current file set. Buckets named here may still be
    /// outputs of in-flight merges; the publish pipeline resolves them
    /// before writing anything.
    pub fn queue_current_history(&mut self, checkpoint: u32) -> Result<()> {
        let has = HistoryArchiveState::new(checkpoint, self.buckets.current_file_set());
        self.queue.enqueue(&has)
    }

    /// Start publication of the frontmost queued checkpoint, unless
    /// publication is disabled or a pipeline is already in flight.
    /// Returns the number of pipelines started (0 or 1).
    pub fn publish_queued_history(&mut self) -> Result<usize> {
        if !self.publication_enabled || self.active.is_some() {
            return Ok(0);
        }
        let Some(has) = self.queue.frontmost().cloned() else {
            return Ok(0);
        };

        let checkpoint = has.current_ledger;
        let (first, last) = self.calc.checkpoint_span(checkpoint);
        let range = LedgerRange::new(first, last)?;
        let headers = self.source.headers_in(range)?;
        let tx_sets = self.source.tx_sets_in(range)?;
        let snapshot = Arc::new(StateSnapshot::new(
            has,
            headers,
            tx_sets,
            &self.config.staging_dir,
            self.config.compress_streams,
        ));

        let writable: Vec<Archive> = self
            .archives
            .iter()
            .filter(|a| a.writable())
            .cloned()
            .collect();
        let sequence = publish_sequence(
            Arc::clone(&snapshot),
            Arc::clone(&self.buckets),
            writable,
            self.config.retry,
        );
        // Retries live inside the stages; the pipeline as a whole runs once.
        let node = WorkNode::new(Box::new(sequence), RetryPolicy::no_retries());

        info!(checkpoint, "publication pipeline started");
        self.active = Some(ActivePublish { node, snapshot });
        Ok(1)
    }

    /// Crank in-flight work: the active publication pipeline (reaping and
    /// confirming it when it finishes) and any scheduled catch-ups.
    pub fn drive(&mut self, now: Instant) -> Result<()> {
        self.scheduler.crank(now);

        let finished = match &mut self.active {
            Some(active) => {
                active.node.crank(now);
                active.node.is_terminal()
            }
            None => false,
        };
        if finished {
            if let Some(mut active) = self.active.take() {
                let success = active.node.state() == WorkState::Success;
                if let Some(err) = active.node.take_error() {
                    warn!(
                        checkpoint = active.snapshot.checkpoint(),
                        error = %err,
                        "publication pipeline failed"
                    );
                }
                let buckets = active.snapshot.has().buckets.clone();
                self.history_published(active.snapshot.checkpoint(), &buckets, success)?;
                if success {
                    active.snapshot.discard_staging();
                }
            }
        }
        Ok(())
    }

    /// Record a publication outcome. On success the checkpoint leaves the
    /// durable queue and the next queued checkpoint (if any) starts
    /// immediately; on failure it stays queued and is re-attempted on the
    /// next publication kick.
    pub fn history_published(
        &mut self,
        checkpoint: u32,
        published_buckets: &[Hash256],
        success: bool,
    ) -> Result<()> {
        self.queue
            .confirm_published(checkpoint, published_buckets, success)?;
        if success {
            self.publish_queued_history()?;
        }
        Ok(())
    }

    /// Whether a publication pipeline is currently in flight.
    pub fn publishing(&self) -> bool {
        self.active.is_some()
    }

    /// Number of queued checkpoints awaiting publication.
    pub fn publish_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Bucket hashes the state store must not delete: everything a queued
    /// snapshot still references.
    pub fn referenced_buckets(&mut self) -> Vec<Hash256> {
        self.queue.referenced_buckets()
    }

    /// Referenced bucket files absent from the local state store.
    pub fn missing_referenced_buckets(&self) -> Vec<Hash256> {
        self.queue.missing_referenced_buckets(self.buckets.as_ref())
    }

    /// One-line publication status for operator logs.
    pub fn status(&self) -> String {
        match (self.queue.min_queued(), self.queue.max_queued()) {
            (Some(lo), Some(hi)) => {
                let state = match &self.active {
                    Some(active) => active.node.status(),
                    None if self.publication_enabled => "idle".to_string(),
                    None => "publication disabled".to_string(),
                };
                format!(
                    "Publishing {} queued checkpoints [{}-{}]: {}",
                    self.queue.len(),
                    lo,
                    hi,
                    state
                )
            }
            _ => "Publishing 0 queued checkpoints".to_string(),
        }
    }

    /// Schedule a catch-up to `target` under the given replay policy.
    /// Returns a handle usable with [`catchup_state`](Self::catchup_state);
    /// the run is driven by subsequent [`drive`](Self::drive) calls.
    pub fn catchup(&mut self, target: u32, policy: ReplayPolicy) -> Result<usize> {
        let ctx = CatchupContext {
            config: self.config.clone(),
            archives: self.archives.clone(),
            buckets: Arc::clone(&self.buckets),
            applier: Arc::clone(&self.applier),
            history_metrics: Arc::clone(&self.metrics),
            metrics: Arc::clone(&self.catchup_metrics),
        };
        let sequence = catchup_sequence(&ctx, target, policy)?;
        Ok(self
            .scheduler
            .add(Box::new(sequence), RetryPolicy::no_retries()))
    }

    /// State of a scheduled catch-up.
    pub fn catchup_state(&self, handle: usize) -> Option<WorkState> {
        self.scheduler.state_of(handle)
    }

    /// Take the error that failed a scheduled catch-up.
    pub fn take_catchup_error(&mut self, handle: usize) -> Option<crate::error::Error> {
        self.scheduler.take_error(handle)
    }

    /// Drive all in-flight work to completion under virtual time. Test
    /// and tooling convenience; production nodes call `drive` from their
    /// event loop instead.
    pub fn run_to_completion(&mut self, start: Instant) -> Result<()> {
        let mut now = start;
        for _ in 0..1_000_000u32 {
            self.drive(now)?;
            let idle_scheduler = self.scheduler.all_done();
            let idle_publish = self.active.is_none();
            if idle_scheduler && idle_publish {
                return Ok(());
            }
            let wake = self
                .scheduler
                .next_wake()
                .into_iter()
                .chain(self.active.as_ref().and_then(|a| a.node.wake_at()))
                .min();
            match wake {
                Some(wake) if wake > now => now = wake,
                _ => now += std::time::Duration::from_millis(1),
            }
        }
        Ok(())
    }
}
