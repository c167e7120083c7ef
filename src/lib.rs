//! History publication and catch-up engine for a distributed ledger node.
//!
//! This crate provides the subsystem that keeps long-term ledger history
//! in external archives and brings lagging nodes back in sync from them:
//!
//! - **Publication**: at every checkpoint boundary the node durably
//!   queues a snapshot of its state and ships the checkpoint's headers,
//!   transactions and state-store files to every writable archive.
//! - **Catch-up**: a node behind the network downloads archived history,
//!   verifies it against the hash chain anchored at its own trusted
//!   state, and replays it (optionally restoring bulk state from
//!   archived buckets first).
//!
//! # Example
//!
//! ```rust,ignore
//! use ledger_history::{HistoryConfig, HistoryManager, ReplayPolicy};
//! use std::time::Instant;
//!
//! let mut manager = HistoryManager::new(
//!     HistoryConfig::new("./history-staging"),
//!     queue_store,
//!     archives,
//!     bucket_store,
//!     history_source,
//!     ledger_applier,
//!     metrics,
//!     catchup_metrics,
//! )?;
//!
//! // After each ledger close:
//! manager.maybe_queue_checkpoint(closed_seq)?;
//!
//! // To rejoin after falling behind, replaying the last 64 ledgers:
//! manager.catchup(target, ReplayPolicy::Recent(64))?;
//!
//! // From the node's main loop:
//! manager.drive(Instant::now())?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              HistoryManager                  │
//! │  • maybe_queue_checkpoint / publish          │
//! │  • catchup(target, policy)                   │
//! │  • drive(now)                                │
//! └─────────────────────────────────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐   ┌─────────────────────┐
//! │  PublishQueue   │   │    WorkScheduler    │
//! │  durable FIFO + │   │  cooperative crank  │
//! │  bucket refs    │   │  loop, retries      │
//! └─────────────────┘   └─────────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐   ┌─────────────────────┐
//! │ publish pipeline│   │  catch-up sequence  │
//! │ resolve→write→  │   │  fetch→verify→      │
//! │ put             │   │  restore→apply      │
//! └─────────────────┘   └─────────────────────┘
//!          │                      │
//!          └──────────┬───────────┘
//!                     ▼
//!          ┌─────────────────────┐
//!          │   history archives  │
//!          │ (ArchiveTransport)  │
//!          └─────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! The whole subsystem is single-threaded and cooperatively scheduled:
//! every long-running operation is decomposed into bounded `Work` steps
//! cranked from the caller's loop. Background bucket merges run outside
//! this crate and are observed through pollable handles. Time is always
//! a parameter, which keeps retry and backoff behavior fully
//! deterministic under test.

pub mod archive;
pub mod bucket;
pub mod catchup;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod metrics;
pub mod publish;
pub mod queue;
pub mod range;
pub mod stream;
pub mod testing;
pub mod types;
pub mod work;

// Re-export the main surface for convenience
pub use config::{HistoryConfig, ACCELERATED_CHECKPOINT_FREQUENCY, DEFAULT_CHECKPOINT_FREQUENCY};
pub use error::{ArchiveError, Error, QueueError, Result, StreamError, VerifyError};
pub use manager::HistoryManager;
pub use types::{
    Hash256, LedgerHeader, LedgerHeaderHistoryEntry, TransactionHistoryEntry, GENESIS_SEQ,
};

// Re-export checkpoint and range types
pub use checkpoint::CheckpointCalculator;
pub use range::{CatchupRange, CheckpointRange, LedgerRange, ReplayPolicy};

// Re-export archive types
pub use archive::{
    Archive, ArchiveTransport, FileCategory, FsTransport, HistoryArchiveState, WELL_KNOWN_PATH,
};

// Re-export collaborator seams
pub use bucket::{BucketStore, MergeHandle};
pub use ledger::{HistorySource, LedgerApplier};
pub use queue::{FsQueueStore, MemQueueStore, PublishQueue, QueueStore};

// Re-export work scheduling types
pub use work::{RetryPolicy, Work, WorkScheduler, WorkSequence, WorkState};

// Re-export metrics types
pub use metrics::{CatchupMetrics, CatchupPerformedWork, Counter, HistoryMetrics};
