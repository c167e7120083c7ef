//! Seam to the append-only state store ("bucket" store).
//!
//! The store's merge/eviction machinery is an external collaborator; this
//! subsystem only needs to enumerate and read content-addressed files,
//! observe in-flight background merges through a pollable handle, and hand
//! the store a descriptor to restore from during catch-up. Garbage
//! collection stays inside the store and must honor the publish queue's
//! referenced-file set as a do-not-delete list.

use crate::archive::HistoryArchiveState;
use crate::error::Result;
use crate::types::Hash256;
use parking_lot::Mutex;
use std::sync::Arc;

/// Pollable handle to a background bucket merge running on a worker
/// thread outside this subsystem. Cloning shares the same underlying
/// slot; the resolve stage of the publish pipeline polls handles until
/// every merge referenced by a snapshot has produced a concrete file.
#[derive(Clone)]
pub struct MergeHandle {
    output: Arc<Mutex<Option<Hash256>>>,
}

impl MergeHandle {
    /// A handle for a merge that has not finished yet.
    pub fn pending() -> Self {
        MergeHandle {
            output: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle that is already resolved.
    pub fn ready(output: Hash256) -> Self {
        MergeHandle {
            output: Arc::new(Mutex::new(Some(output))),
        }
    }

    /// Mark the merge complete with its output file hash. Called by the
    /// store's worker thread.
    pub fn complete(&self, output: Hash256) {
        *self.output.lock() = Some(output);
    }

    /// The merge output, if the merge has finished.
    pub fn try_output(&self) -> Option<Hash256> {
        *self.output.lock()
    }
}

/// Collaborator interface to the state store.
pub trait BucketStore: Send + Sync {
    /// The complete set of content-addressed files making up current
    /// state, in state-store order.
    fn current_file_set(&self) -> Vec<Hash256>;

    /// Whether the file for `hash` is present locally.
    fn file_exists(&self, hash: &Hash256) -> bool;

    /// Read the file for `hash`.
    fn read_file(&self, hash: &Hash256) -> Result<Vec<u8>>;

    /// Ingest a downloaded file under its content hash. Re-adding an
    /// existing file is a no-op.
    fn add_file(&self, hash: &Hash256, bytes: &[u8]) -> Result<()>;

    /// The in-flight background merge whose output will be `hash`, if one
    /// is still running.
    fn merge_in_progress(&self, hash: &Hash256) -> Option<MergeHandle>;

    /// Restore local state from the buckets named by a descriptor,
    /// leaving the store at the state captured by `has`.
    fn restore(&self, has: &HistoryArchiveState) -> Result<()>;

    /// Files referenced by `has` that are absent locally.
    fn missing_files(&self, has: &HistoryArchiveState) -> Vec<Hash256> {
        has.buckets
            .iter()
            .filter(|h| !self.file_exists(h))
            .copied()
            .collect()
    }
}
