//! Configuration for the history subsystem.

use crate::work::RetryPolicy;
use std::path::PathBuf;

/// Production checkpoint frequency: one checkpoint every 64 ledgers.
pub const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 64;

/// Reduced frequency for artificially accelerated tests.
pub const ACCELERATED_CHECKPOINT_FREQUENCY: u32 = 8;

/// Configuration for publication and catch-up.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Checkpoint frequency; must be positive.
    pub checkpoint_frequency: u32,

    /// Local staging directory for snapshot files awaiting transfer and
    /// for downloaded history awaiting replay.
    pub staging_dir: PathBuf,

    /// Whether record stream files are LZ4-compressed.
    pub compress_streams: bool,

    /// Retry policy for transient archive and I/O failures.
    pub retry: RetryPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
            staging_dir: PathBuf::from("./history-staging"),
            compress_streams: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl HistoryConfig {
    /// Create a configuration with the given staging directory.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            ..Default::default()
        }
    }

    /// Configuration preset for accelerated testing: a small checkpoint
    /// frequency and no stream compression.
    pub fn accelerated_for_testing(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_frequency: ACCELERATED_CHECKPOINT_FREQUENCY,
            staging_dir: staging_dir.into(),
            compress_streams: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the checkpoint frequency.
    pub fn with_checkpoint_frequency(mut self, frequency: u32) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    /// Enable or disable stream compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_streams = compress;
        self
    }

    /// Set the retry policy for transient failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
