//! Durable publish queue and bucket reference accounting.
//!
//! A snapshot descriptor is durably enqueued *before* its publication
//! pipeline starts and removed only *after* confirmed success, so a crash
//! at any point loses at most re-buildable pipeline state, never a
//! snapshot, and can never double-count a publish. While a descriptor is
//! queued, every bucket it references is protected from the state store's
//! garbage collector through [`PublishQueue::referenced_buckets`].

use crate::archive::HistoryArchiveState;
use crate::bucket::BucketStore;
use crate::error::{Error, QueueError, Result};
use crate::metrics::HistoryMetrics;
use crate::types::Hash256;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Durable row store for the queue: one row per ledger sequence with a
/// text payload. The design needs only atomic single-row insert/delete
/// and a full scan; no multi-row transactional semantics.
pub trait QueueStore: Send {
    /// Insert a row; fails if one already exists for `seq`.
    fn insert(&mut self, seq: u32, text: &str) -> Result<()>;

    /// Delete the row for `seq`; fails if absent.
    fn remove(&mut self, seq: u32) -> Result<()>;

    /// Whether a row exists for `seq`.
    fn contains(&self, seq: u32) -> bool;

    /// All rows, ascending by ledger sequence.
    fn load_all(&self) -> Result<Vec<(u32, String)>>;
}

/// Filesystem-backed row store: one `<seq>.json` file per queued ledger
/// under a dedicated directory. Rows are written to a temporary name and
/// renamed into place, which gives single-row atomicity; directory
/// creation is idempotent.
pub struct FsQueueStore {
    dir: PathBuf,
}

impl FsQueueStore {
    /// Open the store, creating its directory if absent.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FsQueueStore { dir })
    }

    fn row_path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!("{seq:010}.json"))
    }
}

impl QueueStore for FsQueueStore {
    fn insert(&mut self, seq: u32, text: &str) -> Result<()> {
        let path = self.row_path(seq);
        if path.exists() {
            return Err(QueueError::AlreadyQueued(seq).into());
        }
        let tmp = self.dir.join(format!(".tmp-{seq:010}"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, seq: u32) -> Result<()> {
        let path = self.row_path(seq);
        if !path.exists() {
            return Err(QueueError::NotQueued(seq).into());
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn contains(&self, seq: u32) -> bool {
        self.row_path(seq).exists()
    }

    fn load_all(&self) -> Result<Vec<(u32, String)>> {
        let mut rows = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(seq) = stem.parse::<u32>() else {
                continue;
            };
            rows.push((seq, fs::read_to_string(entry.path())?));
        }
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows)
    }
}

/// In-memory row store for tests and embedding.
#[derive(Default)]
pub struct MemQueueStore {
    rows: BTreeMap<u32, String>,
}

impl MemQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemQueueStore {
    fn insert(&mut self, seq: u32, text: &str) -> Result<()> {
        if self.rows.contains_key(&seq) {
            return Err(QueueError::AlreadyQueued(seq).into());
        }
        self.rows.insert(seq, text.to_string());
        Ok(())
    }

    fn remove(&mut self, seq: u32) -> Result<()> {
        if self.rows.remove(&seq).is_none() {
            return Err(QueueError::NotQueued(seq).into());
        }
        Ok(())
    }

    fn contains(&self, seq: u32) -> bool {
        self.rows.contains_key(&seq)
    }

    fn load_all(&self) -> Result<Vec<(u32, String)>> {
        Ok(self
            .rows
            .iter()
            .map(|(seq, text)| (*seq, text.clone()))
            .collect())
    }
}

/// Reference counts over bucket hashes, unioned across every queued
/// snapshot. A hash leaves the index exactly when no queued snapshot
/// references it.
#[derive(Debug, Default)]
pub struct BucketRefIndex {
    counts: BTreeMap<Hash256, u32>,
}

impl BucketRefIndex {
    fn add_all<'a>(&mut self, hashes: impl IntoIterator<Item = &'a Hash256>) {
        for hash in hashes {
            *self.counts.entry(*hash).or_insert(0) += 1;
        }
    }

    fn remove_all<'a>(&mut self, hashes: impl IntoIterator<Item = &'a Hash256>) {
        for hash in hashes {
            match self.counts.get_mut(hash) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.counts.remove(hash);
                }
                None => {
                    // Underflow means queue mutations and confirmations got
                    // out of step; a defect, reported loudly.
                    warn!(%hash, "bucket reference count underflow");
                }
            }
        }
    }

    /// Currently referenced hashes.
    pub fn keys(&self) -> Vec<Hash256> {
        self.counts.keys().copied().collect()
    }

    /// Reference count for one hash.
    pub fn count(&self, hash: &Hash256) -> u32 {
        self.counts.get(hash).copied().unwrap_or(0)
    }
}

/// Durable FIFO of snapshot descriptors awaiting publication, drained
/// strictly in ascending ledger order.
pub struct PublishQueue {
    store: Box<dyn QueueStore>,
    states: BTreeMap<u32, HistoryArchiveState>,
    refs: BucketRefIndex,
    enqueue_times: HashMap<u32, Instant>,
    referenced_cache: Option<Vec<Hash256>>,
    metrics: Arc<HistoryMetrics>,
}

impl PublishQueue {
    /// Open the queue over a durable store, reloading any rows left from
    /// a previous run and rebuilding the bucket reference index.
    pub fn open(store: Box<dyn QueueStore>, metrics: Arc<HistoryMetrics>) -> Result<Self> {
        let mut states = BTreeMap::new();
        let mut refs = BucketRefIndex::default();
        for (seq, text) in store.load_all()? {
            let has = HistoryArchiveState::from_text(&text).map_err(|e| {
                Error::Queue(QueueError::CorruptRow {
                    seq,
                    reason: e.to_string(),
                })
            })?;
            refs.add_all(&has.buckets);
            states.insert(seq, has);
        }
        if !states.is_empty() {
            info!(rows = states.len(), "reloaded publish queue");
        }
        Ok(PublishQueue {
            store,
            states,
            refs,
            enqueue_times: HashMap::new(),
            referenced_cache: None,
            metrics,
        })
    }

    /// Durably enqueue a snapshot descriptor, keyed by its ledger
    /// sequence. A duplicate sequence is an invariant violation: callers
    /// only enqueue at fresh checkpoint boundaries.
    pub fn enqueue(&mut self, has: &HistoryArchiveState) -> Result<()> {
        let seq = has.current_ledger;
        if self.states.contains_key(&seq) {
            warn!(ledger = seq, "duplicate publish queue insertion");
            return Err(QueueError::AlreadyQueued(seq).into());
        }
        self.store.insert(seq, &has.to_text())?;
        self.states.insert(seq, has.clone());
        self.refs.add_all(&has.buckets);
        self.referenced_cache = None;
        self.enqueue_times.insert(seq, Instant::now());
        self.metrics.publish_queued.inc();
        debug!(ledger = seq, buckets = has.buckets.len(), "queued snapshot for publish");
        Ok(())
    }

    /// The lowest-sequence queued descriptor: the next publication
    /// candidate.
    pub fn frontmost(&self) -> Option<&HistoryArchiveState> {
        self.states.values().next()
    }

    /// Record the outcome of a publication attempt for `seq`.
    ///
    /// On success the row is deleted, the reference index is decremented
    /// by the published bucket set, and the enqueue-to-publish latency is
    /// recorded. On failure the entry stays queued for retry on the next
    /// drive attempt. Returns the publish latency on success, when the
    /// enqueue time is known (it is lost across a restart).
    pub fn confirm_published(
        &mut self,
        seq: u32,
        published_buckets: &[Hash256],
        success: bool,
    ) -> Result<Option<Duration>> {
        if !success {
            if !self.states.contains_key(&seq) {
                // Confirmation, successful or not, is only valid for a
                // queued ledger.
                warn!(ledger = seq, "failure confirmation for a ledger that is not queued");
                return Err(QueueError::NotQueued(seq).into());
            }
            self.metrics.publish_failure.inc();
            warn!(ledger = seq, "publish failed; entry remains queued");
            return Ok(None);
        }
        if self.states.remove(&seq).is_none() {
            // Double confirmation: a defect, not a transient condition.
            warn!(ledger = seq, "confirmation for a ledger that is not queued");
            return Err(QueueError::NotQueued(seq).into());
        }
        self.store.remove(seq)?;
        self.refs.remove_all(published_buckets);
        self.referenced_cache = None;
        self.metrics.publish_success.inc();

        let latency = self.enqueue_times.remove(&seq).map(|at| at.elapsed());
        if let Some(latency) = latency {
            self.metrics.record_publish_latency(latency);
        }
        info!(ledger = seq, ?latency, "published checkpoint");
        Ok(latency)
    }

    /// Number of queued snapshots.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Lowest queued ledger sequence.
    pub fn min_queued(&self) -> Option<u32> {
        self.states.keys().next().copied()
    }

    /// Highest queued ledger sequence.
    pub fn max_queued(&self) -> Option<u32> {
        self.states.keys().next_back().copied()
    }

    /// All bucket hashes referenced by queued snapshots: the state
    /// store's do-not-delete set. Computed lazily and cached until the
    /// next queue mutation.
    pub fn referenced_buckets(&mut self) -> Vec<Hash256> {
        if self.referenced_cache.is_none() {
            self.referenced_cache = Some(self.refs.keys());
        }
        self.referenced_cache.clone().unwrap_or_default()
    }

    /// Reference count for one bucket hash.
    pub fn reference_count(&self, hash: &Hash256) -> u32 {
        self.refs.count(hash)
    }

    /// Referenced bucket files that are absent from the local state
    /// store: evidence of a corrupted or partially-evicted queue.
    /// Surfaced for repair tooling, never auto-healed.
    pub fn missing_referenced_buckets(&self, buckets: &dyn BucketStore) -> Vec<Hash256> {
        let mut missing: Vec<Hash256> = self
            .states
            .values()
            .flat_map(|has| buckets.missing_files(has))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash(n: u8) -> Hash256 {
        Hash256::of(&[n])
    }

    fn queue() -> PublishQueue {
        PublishQueue::open(Box::new(MemQueueStore::new()), Arc::new(HistoryMetrics::new()))
            .unwrap()
    }

    #[test]
    fn test_enqueue_confirm_roundtrip_with_shared_buckets() {
        let mut q = queue();
        let shared = hash(1);
        let only_first = hash(2);
        let only_second = hash(3);

        q.enqueue(&HistoryArchiveState::new(63, vec![shared, only_first]))
            .unwrap();
        q.enqueue(&HistoryArchiveState::new(127, vec![shared, only_second]))
            .unwrap();
        assert_eq!(q.reference_count(&shared), 2);

        q.confirm_published(63, &[shared, only_first], true).unwrap();

        // Buckets unique to the published snapshot are released; shared
        // ones stay referenced by the still-queued snapshot.
        let referenced = q.referenced_buckets();
        assert!(!referenced.contains(&only_first));
        assert!(referenced.contains(&shared));
        assert!(referenced.contains(&only_second));
        assert_eq!(q.reference_count(&shared), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.min_queued(), Some(127));
    }

    #[test]
    fn test_duplicate_enqueue_is_invariant_violation() {
        let mut q = queue();
        let has = HistoryArchiveState::new(63, vec![hash(1)]);
        q.enqueue(&has).unwrap();
        assert!(matches!(
            q.enqueue(&has),
            Err(Error::Queue(QueueError::AlreadyQueued(63)))
        ));
        // The failed insert must not have double-counted references.
        assert_eq!(q.reference_count(&hash(1)), 1);
    }

    #[test]
    fn test_fail_then_succeed_scenario() {
        let metrics = Arc::new(HistoryMetrics::new());
        let mut q =
            PublishQueue::open(Box::new(MemQueueStore::new()), Arc::clone(&metrics)).unwrap();
        q.enqueue(&HistoryArchiveState::new(64, vec![hash(1)])).unwrap();
        q.enqueue(&HistoryArchiveState::new(128, vec![hash(2)])).unwrap();

        q.confirm_published(64, &[hash(1)], false).unwrap();
        assert_eq!(q.len(), 2);
        q.confirm_published(64, &[hash(1)], true).unwrap();

        assert_eq!(q.len(), 1);
        assert_eq!(q.min_queued(), Some(128));
        assert_eq!(q.max_queued(), Some(128));
        assert_eq!(metrics.publish_success.get(), 1);
        assert_eq!(metrics.publish_failure.get(), 1);
    }

    #[test]
    fn test_double_confirmation_is_defect() {
        let mut q = queue();
        q.enqueue(&HistoryArchiveState::new(63, vec![hash(1)])).unwrap();
        q.confirm_published(63, &[hash(1)], true).unwrap();
        assert!(matches!(
            q.confirm_published(63, &[hash(1)], true),
            Err(Error::Queue(QueueError::NotQueued(63)))
        ));
    }

    #[test]
    fn test_failure_confirmation_for_unqueued_ledger_is_defect() {
        let metrics = Arc::new(HistoryMetrics::new());
        let mut q =
            PublishQueue::open(Box::new(MemQueueStore::new()), Arc::clone(&metrics)).unwrap();
        q.enqueue(&HistoryArchiveState::new(63, vec![hash(1)])).unwrap();

        assert!(matches!(
            q.confirm_published(127, &[], false),
            Err(Error::Queue(QueueError::NotQueued(127)))
        ));
        // The bogus confirmation is not counted as a real attempt.
        assert_eq!(metrics.publish_failure.get(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_frontmost_drains_in_ascending_order() {
        let mut q = queue();
        q.enqueue(&HistoryArchiveState::new(127, vec![])).unwrap();
        q.enqueue(&HistoryArchiveState::new(63, vec![])).unwrap();
        assert_eq!(q.frontmost().map(|h| h.current_ledger), Some(63));
        q.confirm_published(63, &[], true).unwrap();
        assert_eq!(q.frontmost().map(|h| h.current_ledger), Some(127));
    }

    #[test]
    fn test_fs_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(HistoryMetrics::new());
        let has63 = HistoryArchiveState::new(63, vec![hash(1), hash(2)]);
        let has127 = HistoryArchiveState::new(127, vec![hash(2)]);

        {
            let store = FsQueueStore::open(dir.path()).unwrap();
            let mut q = PublishQueue::open(Box::new(store), Arc::clone(&metrics)).unwrap();
            q.enqueue(&has63).unwrap();
            q.enqueue(&has127).unwrap();
        }

        // Simulated restart: queue rows and reference index come back.
        let store = FsQueueStore::open(dir.path()).unwrap();
        let mut q = PublishQueue::open(Box::new(store), metrics).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.frontmost(), Some(&has63));
        assert_eq!(q.reference_count(&hash(2)), 2);

        q.confirm_published(63, &has63.buckets, true).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.reference_count(&hash(2)), 1);
        assert_eq!(q.reference_count(&hash(1)), 0);
    }

    #[test]
    fn test_fs_store_rejects_duplicate_rows() {
        let dir = tempdir().unwrap();
        let mut store = FsQueueStore::open(dir.path()).unwrap();
        store.insert(63, "{}").unwrap();
        assert!(store.contains(63));
        assert!(matches!(
            store.insert(63, "{}"),
            Err(Error::Queue(QueueError::AlreadyQueued(63)))
        ));
        store.remove(63).unwrap();
        assert!(matches!(
            store.remove(63),
            Err(Error::Queue(QueueError::NotQueued(63)))
        ));
    }
}
