//! History archives: snapshot descriptors, the archive naming scheme, and
//! the transport seam to remote storage.

use crate::error::ArchiveError;
use crate::types::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Version tag embedded in serialized snapshot descriptors.
pub const HISTORY_ARCHIVE_STATE_VERSION: u32 = 1;

/// Remote name of the archive's most recent snapshot descriptor.
pub const WELL_KNOWN_PATH: &str = ".well-known/history.json";

/// Immutable record of the ledger state captured at a checkpoint: the
/// ledger sequence plus the complete set of content-addressed state-store
/// files (bucket hashes) at that moment.
///
/// Serializes to a self-describing JSON text form for durable storage in
/// the publish queue and in archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryArchiveState {
    /// Descriptor format version.
    pub version: u32,

    /// Ledger sequence at capture time.
    pub current_ledger: u32,

    /// Bucket hashes referenced by the captured state, as listed by the
    /// state store. Order is not significant.
    pub buckets: Vec<Hash256>,
}

impl HistoryArchiveState {
    /// Create a descriptor for the given ledger and bucket set.
    pub fn new(current_ledger: u32, buckets: Vec<Hash256>) -> Self {
        HistoryArchiveState {
            version: HISTORY_ARCHIVE_STATE_VERSION,
            current_ledger,
            buckets,
        }
    }

    /// The bucket hashes as a set.
    pub fn bucket_set(&self) -> BTreeSet<Hash256> {
        self.buckets.iter().copied().collect()
    }

    /// Serialize to the durable text form.
    pub fn to_text(&self) -> String {
        // Serialization of a plain struct with string map keys cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Parse the durable text form.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Two descriptors are equal iff their ledger sequence and bucket-hash
/// *set* are equal; bucket order is irrelevant.
impl PartialEq for HistoryArchiveState {
    fn eq(&self, other: &Self) -> bool {
        self.current_ledger == other.current_ledger && self.bucket_set() == other.bucket_set()
    }
}

impl Eq for HistoryArchiveState {}

/// Category of a published history file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    /// Snapshot descriptor for one checkpoint.
    Has,
    /// Ledger-header record stream for one checkpoint.
    Ledger,
    /// Transaction record stream for one checkpoint.
    Transactions,
    /// A content-addressed state-store file.
    Bucket,
}

impl FileCategory {
    /// Directory and basename prefix for the category.
    pub fn prefix(&self) -> &'static str {
        match self {
            FileCategory::Has => "history",
            FileCategory::Ledger => "ledger",
            FileCategory::Transactions => "transactions",
            FileCategory::Bucket => "bucket",
        }
    }

    /// File extension for the category.
    pub fn extension(&self) -> &'static str {
        match self {
            FileCategory::Has => "json",
            _ => "dat",
        }
    }

    /// Local staging basename for a checkpoint file of this category.
    pub fn checkpoint_basename(&self, checkpoint: u32) -> String {
        format!("{}-{:08x}.{}", self.prefix(), checkpoint, self.extension())
    }

    /// Remote path of a checkpoint file of this category. Files fan out
    /// over three levels of hex-prefix directories so no archive
    /// directory grows unboundedly:
    /// `ledger/00/00/00/ledger-0000003f.dat`.
    pub fn remote_checkpoint_path(&self, checkpoint: u32) -> String {
        let hex = format!("{:08x}", checkpoint);
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix(),
            &hex[0..2],
            &hex[2..4],
            &hex[4..6],
            self.checkpoint_basename(checkpoint)
        )
    }

    /// Remote path of a bucket file, fanned out by hash prefix.
    pub fn remote_bucket_path(hash: &Hash256) -> String {
        let hex = hash.to_hex();
        format!(
            "bucket/{}/{}/{}/bucket-{}.dat",
            &hex[0..2],
            &hex[2..4],
            &hex[4..6],
            hex
        )
    }
}

/// Parent directory of a remote path, or empty for a bare name.
pub fn remote_dir_of(remote: &str) -> &str {
    match remote.rfind('/') {
        Some(idx) => &remote[..idx],
        None => "",
    }
}

/// Transport seam to one archive backend. Implementations must tolerate
/// repeated `store` and `make_dir` calls for the same name: the publish
/// pipeline re-runs whole stages on retry.
pub trait ArchiveTransport: Send + Sync {
    /// Download a remote file to a local path.
    fn fetch(&self, remote: &str, local: &Path) -> Result<(), ArchiveError>;

    /// Upload a local file under a remote name.
    fn store(&self, local: &Path, remote: &str) -> Result<(), ArchiveError>;

    /// Create a remote directory; succeeds if it already exists.
    fn make_dir(&self, remote_dir: &str) -> Result<(), ArchiveError>;
}

/// One configured archive: a named transport with read/write permissions.
#[derive(Clone)]
pub struct Archive {
    name: String,
    readable: bool,
    writable: bool,
    transport: Arc<dyn ArchiveTransport>,
}

impl Archive {
    /// Configure an archive.
    pub fn new(
        name: impl Into<String>,
        readable: bool,
        writable: bool,
        transport: Arc<dyn ArchiveTransport>,
    ) -> Self {
        Archive {
            name: name.into(),
            readable,
            writable,
            transport,
        }
    }

    /// The archive's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether catch-up may read from this archive.
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// Whether publication may write to this archive.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Download a remote file to a local path.
    pub fn fetch(&self, remote: &str, local: &Path) -> Result<(), ArchiveError> {
        self.transport.fetch(remote, local)
    }

    /// Upload a local file under a remote name.
    pub fn store(&self, local: &Path, remote: &str) -> Result<(), ArchiveError> {
        self.transport.store(local, remote)
    }

    /// Create a remote directory.
    pub fn make_dir(&self, remote_dir: &str) -> Result<(), ArchiveError> {
        self.transport.make_dir(remote_dir)
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("name", &self.name)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

/// Archive transport backed by a local directory tree. Used for
/// filesystem archives and throughout the test suite.
pub struct FsTransport {
    root: std::path::PathBuf,
}

impl FsTransport {
    /// Create a transport rooted at `root`, creating it if absent.
    pub fn new(root: impl Into<std::path::PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsTransport { root })
    }

    fn resolve(&self, remote: &str) -> std::path::PathBuf {
        self.root.join(remote)
    }
}

impl ArchiveTransport for FsTransport {
    fn fetch(&self, remote: &str, local: &Path) -> Result<(), ArchiveError> {
        let src = self.resolve(remote);
        if !src.exists() {
            return Err(ArchiveError::NotFound(remote.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, local)?;
        Ok(())
    }

    fn store(&self, local: &Path, remote: &str) -> Result<(), ArchiveError> {
        let dst = self.resolve(remote);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dst)?;
        Ok(())
    }

    fn make_dir(&self, remote_dir: &str) -> Result<(), ArchiveError> {
        fs::create_dir_all(self.resolve(remote_dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash(n: u8) -> Hash256 {
        Hash256::of(&[n])
    }

    #[test]
    fn test_descriptor_text_roundtrip() {
        let has = HistoryArchiveState::new(63, vec![hash(1), hash(2)]);
        let text = has.to_text();
        assert!(text.contains("\"current_ledger\": 63"));
        let back = HistoryArchiveState::from_text(&text).unwrap();
        assert_eq!(back, has);
    }

    #[test]
    fn test_descriptor_equality_ignores_bucket_order() {
        let a = HistoryArchiveState::new(63, vec![hash(1), hash(2)]);
        let b = HistoryArchiveState::new(63, vec![hash(2), hash(1)]);
        let c = HistoryArchiveState::new(127, vec![hash(1), hash(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_remote_naming_scheme() {
        assert_eq!(
            FileCategory::Ledger.remote_checkpoint_path(0x3f),
            "ledger/00/00/00/ledger-0000003f.dat"
        );
        assert_eq!(
            FileCategory::Has.remote_checkpoint_path(0x0a1b2c3d),
            "history/0a/1b/2c/history-0a1b2c3d.json"
        );
        assert_eq!(
            remote_dir_of("ledger/00/00/00/ledger-0000003f.dat"),
            "ledger/00/00/00"
        );
        assert_eq!(remote_dir_of("history.json"), "");

        let bucket = FileCategory::remote_bucket_path(&hash(7));
        assert!(bucket.starts_with("bucket/"));
        assert!(bucket.ends_with(".dat"));
    }

    #[test]
    fn test_fs_transport_roundtrip() {
        let remote_root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let transport = FsTransport::new(remote_root.path()).unwrap();

        let local = work.path().join("payload.dat");
        std::fs::write(&local, b"history bytes").unwrap();

        transport.make_dir("ledger/00/00/00").unwrap();
        transport
            .store(&local, "ledger/00/00/00/ledger-0000003f.dat")
            .unwrap();

        let fetched = work.path().join("fetched.dat");
        transport
            .fetch("ledger/00/00/00/ledger-0000003f.dat", &fetched)
            .unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"history bytes");

        assert!(matches!(
            transport.fetch("ledger/does-not-exist.dat", &fetched),
            Err(ArchiveError::NotFound(_))
        ));
    }
}
