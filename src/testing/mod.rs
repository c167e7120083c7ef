//! Testing utilities for the history subsystem.
//!
//! Provides in-memory collaborators and a deterministic ledger-chain
//! generator so publication and catch-up can be exercised end to end with
//! no network and no real clock:
//!
//! - [`ChainBuilder`]: generates a valid hash-linked ledger chain with a
//!   fixed transaction-set rule, and serves it as a [`HistorySource`].
//! - [`RecordingApplier`]: a [`LedgerApplier`] that closes ledgers by the
//!   same rule, so replayed ledgers reproduce the recorded hashes.
//! - [`MemBucketStore`]: an in-memory bucket store with a merge registry.
//! - [`MemArchiveTransport`]: an in-memory archive with failure
//!   injection for fetches and stores.

mod publish_tests;

use crate::archive::{Archive, ArchiveTransport, HistoryArchiveState};
use crate::bucket::{BucketStore, MergeHandle};
use crate::config::HistoryConfig;
use crate::error::{ArchiveError, Error, Result};
use crate::ledger::{HistorySource, LedgerApplier};
use crate::range::LedgerRange;
use crate::types::{
    Hash256, LedgerHeader, LedgerHeaderHistoryEntry, TransactionHistoryEntry, GENESIS_SEQ,
};
use crate::work::RetryPolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Accelerated test configuration: small checkpoints, no compression and
/// quick backoff so virtual-time runs stay short.
pub fn test_config(staging: &Path) -> HistoryConfig {
    HistoryConfig::accelerated_for_testing(staging).with_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(80)),
    )
}

/// The deterministic transaction set closing ledger `seq`: one
/// transaction whose payload is the sequence number.
pub fn tx_set_for(seq: u32) -> TransactionHistoryEntry {
    TransactionHistoryEntry {
        ledger_seq: seq,
        tx_set: vec![seq.to_le_bytes().to_vec()],
    }
}

/// Deterministically close the ledger after `prev` with `txs`. Both the
/// chain generator and [`RecordingApplier`] close ledgers through this
/// function, so a correct replay reproduces recorded hashes exactly.
pub fn close_ledger(
    prev: &LedgerHeaderHistoryEntry,
    txs: &TransactionHistoryEntry,
) -> LedgerHeaderHistoryEntry {
    let seq = prev.seq() + 1;
    LedgerHeaderHistoryEntry::new(LedgerHeader {
        seq,
        previous_ledger_hash: prev.hash,
        tx_set_hash: txs.hash(),
        bucket_list_hash: Hash256::of(&seq.to_le_bytes()),
        close_time: u64::from(seq) * 5,
    })
}

/// Deterministic generator of a valid ledger chain, serving it as the
/// node's local history tables.
pub struct ChainBuilder {
    entries: Vec<LedgerHeaderHistoryEntry>,
    tx_sets: Vec<TransactionHistoryEntry>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// A chain holding only the genesis ledger.
    pub fn new() -> Self {
        ChainBuilder {
            entries: vec![LedgerHeaderHistoryEntry::genesis()],
            tx_sets: vec![TransactionHistoryEntry::empty(GENESIS_SEQ)],
        }
    }

    /// Extend the chain up to and including `seq`.
    pub fn close_until(&mut self, seq: u32) {
        while self.last().seq() < seq {
            let txs = tx_set_for(self.last().seq() + 1);
            let next = close_ledger(self.last(), &txs);
            self.entries.push(next);
            self.tx_sets.push(txs);
        }
    }

    /// The highest closed ledger.
    pub fn last(&self) -> &LedgerHeaderHistoryEntry {
        // The chain always holds at least genesis.
        &self.entries[self.entries.len() - 1]
    }

    /// The entry for one ledger; panics if not closed yet.
    pub fn entry(&self, seq: u32) -> &LedgerHeaderHistoryEntry {
        &self.entries[(seq - 1) as usize]
    }

    /// The transaction set for one ledger; panics if not closed yet.
    pub fn tx_set(&self, seq: u32) -> &TransactionHistoryEntry {
        &self.tx_sets[(seq - 1) as usize]
    }
}

impl HistorySource for ChainBuilder {
    fn headers_in(&self, range: LedgerRange) -> Result<Vec<LedgerHeaderHistoryEntry>> {
        if range.last > self.last().seq() {
            return Err(Error::Alignment(format!(
                "history range {range} beyond closed ledger {}",
                self.last().seq()
            )));
        }
        Ok(self.entries[(range.first - 1) as usize..=(range.last - 1) as usize].to_vec())
    }

    fn tx_sets_in(&self, range: LedgerRange) -> Result<Vec<TransactionHistoryEntry>> {
        if range.last > self.last().seq() {
            return Err(Error::Alignment(format!(
                "history range {range} beyond closed ledger {}",
                self.last().seq()
            )));
        }
        Ok(self.tx_sets[(range.first - 1) as usize..=(range.last - 1) as usize].to_vec())
    }
}

/// A ledger applier that closes ledgers by the shared deterministic rule
/// and records every sequence it applies.
pub struct RecordingApplier {
    lcl: Mutex<LedgerHeaderHistoryEntry>,
    applied: Mutex<Vec<u32>>,
    fail_at: Mutex<Option<u32>>,
}

impl RecordingApplier {
    /// An applier whose local state is the genesis ledger.
    pub fn genesis() -> Self {
        Self::at(LedgerHeaderHistoryEntry::genesis())
    }

    /// An applier whose local state is the given last-closed ledger.
    pub fn at(lcl: LedgerHeaderHistoryEntry) -> Self {
        RecordingApplier {
            lcl: Mutex::new(lcl),
            applied: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
        }
    }

    /// Make the apply of ledger `seq` fail.
    pub fn fail_at(&self, seq: u32) {
        *self.fail_at.lock() = Some(seq);
    }

    /// Every ledger sequence applied so far, in order.
    pub fn applied(&self) -> Vec<u32> {
        self.applied.lock().clone()
    }
}

impl LedgerApplier for RecordingApplier {
    fn last_closed(&self) -> LedgerHeaderHistoryEntry {
        self.lcl.lock().clone()
    }

    fn apply_transaction_set(
        &self,
        txs: &TransactionHistoryEntry,
    ) -> Result<LedgerHeaderHistoryEntry> {
        if *self.fail_at.lock() == Some(txs.ledger_seq) {
            return Err(Error::Apply(format!(
                "injected apply failure at ledger {}",
                txs.ledger_seq
            )));
        }
        let prev = self.lcl.lock().clone();
        if txs.ledger_seq != prev.seq() + 1 {
            return Err(Error::Apply(format!(
                "apply of ledger {} against last closed {}",
                txs.ledger_seq,
                prev.seq()
            )));
        }
        let next = close_ledger(&prev, txs);
        *self.lcl.lock() = next.clone();
        self.applied.lock().push(txs.ledger_seq);
        Ok(next)
    }

    fn reset_to(&self, entry: &LedgerHeaderHistoryEntry) -> Result<()> {
        *self.lcl.lock() = entry.clone();
        Ok(())
    }
}

/// In-memory bucket store with an in-flight merge registry.
#[derive(Default)]
pub struct MemBucketStore {
    files: Mutex<HashMap<Hash256, Vec<u8>>>,
    current: Mutex<Vec<Hash256>>,
    merges: Mutex<HashMap<Hash256, MergeHandle>>,
    restored: Mutex<Vec<u32>>,
}

impl MemBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a bucket's bytes and add it to the current file set.
    pub fn add_bucket(&self, bytes: &[u8]) -> Hash256 {
        let hash = Hash256::of(bytes);
        self.files.lock().insert(hash, bytes.to_vec());
        self.current.lock().push(hash);
        hash
    }

    /// Replace the current file set.
    pub fn set_current(&self, hashes: Vec<Hash256>) {
        *self.current.lock() = hashes;
    }

    /// Register an in-flight merge whose output will be `hash`, adding it
    /// to the current file set before the file exists.
    pub fn register_merge(&self, hash: Hash256) -> MergeHandle {
        let handle = MergeHandle::pending();
        self.merges.lock().insert(hash, handle.clone());
        self.current.lock().push(hash);
        handle
    }

    /// Complete a registered merge: materialize its output file.
    pub fn complete_merge(&self, hash: Hash256, bytes: &[u8]) {
        self.files.lock().insert(hash, bytes.to_vec());
        if let Some(handle) = self.merges.lock().remove(&hash) {
            handle.complete(hash);
        }
    }

    /// Ledgers whose state has been restored from a descriptor.
    pub fn restored(&self) -> Vec<u32> {
        self.restored.lock().clone()
    }
}

impl BucketStore for MemBucketStore {
    fn current_file_set(&self) -> Vec<Hash256> {
        self.current.lock().clone()
    }

    fn file_exists(&self, hash: &Hash256) -> bool {
        self.files.lock().contains_key(hash)
    }

    fn read_file(&self, hash: &Hash256) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(hash)
            .cloned()
            .ok_or(Error::MissingBucket(*hash))
    }

    fn add_file(&self, hash: &Hash256, bytes: &[u8]) -> Result<()> {
        self.files.lock().insert(*hash, bytes.to_vec());
        Ok(())
    }

    fn merge_in_progress(&self, hash: &Hash256) -> Option<MergeHandle> {
        self.merges.lock().get(hash).cloned()
    }

    fn restore(&self, has: &HistoryArchiveState) -> Result<()> {
        let files = self.files.lock();
        for hash in &has.buckets {
            if !files.contains_key(hash) {
                return Err(Error::MissingBucket(*hash));
            }
        }
        drop(files);
        *self.current.lock() = has.buckets.clone();
        self.restored.lock().push(has.current_ledger);
        Ok(())
    }
}

/// In-memory archive transport with failure injection: the next N fetches
/// or stores fail as unreachable.
#[derive(Default)]
pub struct MemArchiveTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_fetches: AtomicU32,
    fail_stores: AtomicU32,
}

impl MemArchiveTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` stores fail.
    pub fn fail_next_stores(&self, n: u32) {
        self.fail_stores.store(n, Ordering::SeqCst);
    }

    /// Whether a remote name exists.
    pub fn contains(&self, remote: &str) -> bool {
        self.files.lock().contains_key(remote)
    }

    /// Bytes stored under a remote name.
    pub fn get(&self, remote: &str) -> Option<Vec<u8>> {
        self.files.lock().get(remote).cloned()
    }

    /// Overwrite a remote file directly, bypassing the transport seam.
    /// Used to plant corrupted history.
    pub fn put(&self, remote: &str, bytes: Vec<u8>) {
        self.files.lock().insert(remote.to_string(), bytes);
    }

    /// All stored remote names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ArchiveTransport for MemArchiveTransport {
    fn fetch(&self, remote: &str, local: &Path) -> std::result::Result<(), ArchiveError> {
        if Self::take_failure(&self.fail_fetches) {
            return Err(ArchiveError::Unreachable {
                name: "mem".into(),
                reason: "injected fetch failure".into(),
            });
        }
        let Some(bytes) = self.files.lock().get(remote).cloned() else {
            return Err(ArchiveError::NotFound(remote.to_string()));
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(local, bytes)?;
        Ok(())
    }

    fn store(&self, local: &Path, remote: &str) -> std::result::Result<(), ArchiveError> {
        if Self::take_failure(&self.fail_stores) {
            return Err(ArchiveError::Unreachable {
                name: "mem".into(),
                reason: "injected store failure".into(),
            });
        }
        let bytes = fs::read(local)?;
        self.files.lock().insert(remote.to_string(), bytes);
        Ok(())
    }

    fn make_dir(&self, _remote_dir: &str) -> std::result::Result<(), ArchiveError> {
        Ok(())
    }
}

/// A readable and writable archive over a fresh in-memory transport.
pub fn mem_archive(name: &str) -> (Archive, Arc<MemArchiveTransport>) {
    let transport = Arc::new(MemArchiveTransport::new());
    let archive = Archive::new(name, true, true, Arc::clone(&transport) as _);
    (archive, transport)
}
