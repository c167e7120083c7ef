//! Error types for the history subsystem.

use std::io;
use thiserror::Error;

/// Result type alias for history operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the history subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// A requested ledger range is not checkpoint-aligned or is empty.
    ///
    /// Alignment errors are rejected before any I/O and are never retried:
    /// a misaligned request is a programming error in the caller.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// Hash-chain or replay verification failed.
    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Publish queue invariant violation or store failure.
    #[error("publish queue error: {0}")]
    Queue(#[from] QueueError),

    /// Archive transport failure.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Malformed or truncated record stream.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The ledger-state collaborator rejected a transaction set.
    #[error("ledger apply error: {0}")]
    Apply(String),

    /// A bucket file referenced by a queued snapshot is absent locally
    /// with no merge in flight to produce it.
    #[error("bucket file {0} missing from local state store")]
    MissingBucket(crate::types::Hash256),

    /// The enclosing work was aborted before completion.
    #[error("work aborted")]
    Aborted,

    /// Local filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Only transient I/O failures (archive unreachable, file not yet
    /// available, local disk hiccups) are retryable. Verification failures,
    /// alignment errors and invariant violations never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Archive(e) => e.is_transient(),
            Error::Io(_) => true,
            Error::Stream(StreamError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Hash-chain and replay verification errors.
///
/// All of these are fatal to the enclosing checkpoint: a checkpoint is
/// applied in full or not at all, and a verification failure is never
/// retried.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// A header's `previous_ledger_hash` does not match the hash of the
    /// preceding header.
    #[error("hash chain broken at ledger {seq}")]
    ChainMismatch { seq: u32 },

    /// The locally replayed ledger's hash does not match the hash recorded
    /// in the header stream.
    #[error("replayed ledger {seq} does not match recorded hash")]
    ResultHashMismatch { seq: u32 },

    /// A header-stream entry's recorded hash does not match its own header.
    #[error("recorded hash for ledger {seq} does not match its header")]
    HeaderHashMismatch { seq: u32 },

    /// A transaction set does not hash to the value its header commits to.
    #[error("transaction set for ledger {seq} does not match header commitment")]
    TxSetHashMismatch { seq: u32 },

    /// The header stream skipped a ledger sequence.
    #[error("header stream gap: expected ledger {expected}, found {found}")]
    HeaderGap { expected: u32, found: u32 },

    /// The transaction stream has no entry for a ledger the header stream
    /// requires.
    #[error("transaction stream missing ledger {seq}")]
    MissingTxSet { seq: u32 },

    /// The first downloaded header does not chain from the trusted local
    /// last-closed ledger.
    #[error("ledger {seq} does not chain from local last-closed ledger")]
    TrustedLinkMismatch { seq: u32 },

    /// A downloaded bucket file does not hash to its content address.
    #[error("downloaded bucket does not match content hash {hash}")]
    BucketHashMismatch { hash: crate::types::Hash256 },
}

/// Publish queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// An entry already exists for this ledger. Callers only enqueue at
    /// fresh checkpoint boundaries, so this is an invariant violation, not
    /// a recoverable condition.
    #[error("ledger {0} is already queued for publish")]
    AlreadyQueued(u32),

    /// Confirmation arrived for a ledger that is not queued (double
    /// confirmation, or confirmation of a never-queued ledger).
    #[error("ledger {0} is not queued for publish")]
    NotQueued(u32),

    /// A durable row could not be decoded back into a snapshot descriptor.
    #[error("corrupt queue row for ledger {seq}: {reason}")]
    CorruptRow { seq: u32, reason: String },
}

/// Archive transport errors.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The archive could not be reached; retryable.
    #[error("archive {name} unreachable: {reason}")]
    Unreachable { name: String, reason: String },

    /// A remote file was not found. History archives are written
    /// asynchronously, so a missing file may appear later; retryable.
    #[error("remote file not found: {0}")]
    NotFound(String),

    /// No configured archive is writable; publication cannot proceed.
    #[error("no writable history archives configured")]
    NoWritableArchives,

    /// No configured archive is readable; catch-up cannot proceed.
    #[error("no readable history archives configured")]
    NoReadableArchives,

    /// Transport-level I/O failure; retryable.
    #[error("archive io error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Whether the failure is transient (worth retrying with backoff).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArchiveError::Unreachable { .. } | ArchiveError::NotFound(_) | ArchiveError::Io(_)
        )
    }
}

/// Framed record stream errors.
#[derive(Error, Debug)]
pub enum StreamError {
    /// File does not start with the expected magic number.
    #[error("invalid magic number")]
    InvalidMagic,

    /// File was written by a newer format version.
    #[error("unsupported stream version: {0}")]
    UnsupportedVersion(u32),

    /// File ended in the middle of a record.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Per-record checksum mismatch.
    #[error("record checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Record payload failed to encode or decode.
    #[error("record codec error: {0}")]
    Codec(String),

    /// Compression framing failure.
    #[error("compression error: {0}")]
    Compression(String),

    /// Underlying I/O error.
    #[error("stream io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for StreamError {
    fn from(e: bincode::Error) -> Self {
        StreamError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transience() {
        assert!(Error::Io(io::Error::other("disk")).is_transient());
        assert!(Error::Archive(ArchiveError::NotFound("x".into())).is_transient());
        assert!(!Error::Verify(VerifyError::ChainMismatch { seq: 5 }).is_transient());
        assert!(!Error::Queue(QueueError::AlreadyQueued(64)).is_transient());
        assert!(!Error::Alignment("range [1,2] not aligned".into()).is_transient());
    }
}
