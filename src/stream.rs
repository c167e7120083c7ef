//! Framed typed-record file streams.
//!
//! Ledger-header and transaction history files are streams of typed
//! records with a small self-identifying header:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "LHST"                      │
//! │ VERSION: u32 = 1                             │
//! │ FLAGS: u32  (bit 0: LZ4 frame compressed)    │
//! ├──────────────────────────────────────────────┤
//! │ Record 1: LEN: u32 | payload | CRC32: u32    │
//! │ Record 2: ...                                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Payloads are bincode-encoded; each record carries a CRC-32 (iSCSI
//! polynomial) over its length prefix and payload. A stream that ends
//! between records is complete; one that ends inside a record is
//! truncated and fatal to the consumer.

use crate::error::StreamError;
use crc::{Crc, CRC_32_ISCSI};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::Path;

/// Magic number for record stream files.
pub const MAGIC: [u8; 4] = [b'L', b'H', b'S', b'T'];

/// Current format version.
pub const VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Flag: records are LZ4-frame compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Largest accepted record payload. The length prefix arrives before its
/// checksum, so it is bounded before any allocation happens.
pub const MAX_RECORD_SIZE: usize = 32 << 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

enum WriterInner {
    Plain(BufWriter<File>),
    Compressed(Box<FrameEncoder<BufWriter<File>>>),
}

/// Streaming writer of typed records.
pub struct RecordWriter<T> {
    inner: WriterInner,
    records: u64,
    _marker: PhantomData<T>,
}

impl<T: Serialize> RecordWriter<T> {
    /// Create a stream file, writing the format header immediately.
    pub fn create(path: impl AsRef<Path>, compress: bool) -> Result<Self, StreamError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        let flags = if compress { FLAG_COMPRESSED } else { 0 };
        writer.write_all(&flags.to_le_bytes())?;

        let inner = if compress {
            WriterInner::Compressed(Box::new(FrameEncoder::new(writer)))
        } else {
            WriterInner::Plain(writer)
        };
        Ok(Self {
            inner,
            records: 0,
            _marker: PhantomData,
        })
    }

    /// Append one record.
    pub fn write(&mut self, record: &T) -> Result<(), StreamError> {
        let payload = bincode::serialize(record)?;
        let len = (payload.len() as u32).to_le_bytes();

        let mut digest = CRC32.digest();
        digest.update(&len);
        digest.update(&payload);
        let crc = digest.finalize();

        let writer: &mut dyn Write = match &mut self.inner {
            WriterInner::Plain(w) => w,
            WriterInner::Compressed(w) => w,
        };
        writer.write_all(&len)?;
        writer.write_all(&payload)?;
        writer.write_all(&crc.to_le_bytes())?;

        self.records += 1;
        Ok(())
    }

    /// Finish the stream, flush and sync to disk. Returns the number of
    /// records written.
    pub fn finalize(self) -> Result<u64, StreamError> {
        let mut writer = match self.inner {
            WriterInner::Plain(w) => w,
            WriterInner::Compressed(encoder) => encoder
                .finish()
                .map_err(|e| StreamError::Compression(e.to_string()))?,
        };
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| StreamError::Io(std::io::Error::other(e.to_string())))?;
        file.sync_all()?;
        Ok(self.records)
    }
}

enum ReaderInner {
    Plain(BufReader<File>),
    Compressed(Box<FrameDecoder<BufReader<File>>>),
}

/// Streaming reader of typed records.
pub struct RecordReader<T> {
    inner: ReaderInner,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> RecordReader<T> {
    /// Open a stream file, validating its format header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|_| StreamError::UnexpectedEof)?;
        if header[0..4] != MAGIC {
            return Err(StreamError::InvalidMagic);
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
        if version > VERSION {
            return Err(StreamError::UnsupportedVersion(version));
        }
        let flags = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());

        let inner = if flags & FLAG_COMPRESSED != 0 {
            ReaderInner::Compressed(Box::new(FrameDecoder::new(reader)))
        } else {
            ReaderInner::Plain(reader)
        };
        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    /// Read the next record. Returns `Ok(None)` at a clean end of stream;
    /// a stream ending inside a record is `StreamError::UnexpectedEof`.
    pub fn read(&mut self) -> Result<Option<T>, StreamError> {
        let reader: &mut dyn Read = match &mut self.inner {
            ReaderInner::Plain(r) => r,
            ReaderInner::Compressed(r) => r,
        };

        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(reader, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(StreamError::Codec(format!(
                "record length {len} exceeds maximum {MAX_RECORD_SIZE}"
            )));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| StreamError::UnexpectedEof)?;

        let mut crc_buf = [0u8; 4];
        reader
            .read_exact(&mut crc_buf)
            .map_err(|_| StreamError::UnexpectedEof)?;
        let expected = u32::from_le_bytes(crc_buf);

        let mut digest = CRC32.digest();
        digest.update(&len_buf);
        digest.update(&payload);
        let actual = digest.finalize();
        if actual != expected {
            return Err(StreamError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(bincode::deserialize(&payload)?))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

// Distinguishes a clean end-of-stream (zero bytes available) from a
// truncated record (some bytes then EOF).
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<ReadOutcome, StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(StreamError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LedgerHeaderHistoryEntry, TransactionHistoryEntry};
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_plain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("headers.dat");

        let mut writer = RecordWriter::create(&path, false).unwrap();
        let entry = LedgerHeaderHistoryEntry::genesis();
        writer.write(&entry).unwrap();
        assert_eq!(writer.finalize().unwrap(), 1);

        let mut reader = RecordReader::<LedgerHeaderHistoryEntry>::open(&path).unwrap();
        assert_eq!(reader.read().unwrap(), Some(entry));
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_roundtrip_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txs.dat");

        let mut writer = RecordWriter::create(&path, true).unwrap();
        for seq in 1..50u32 {
            writer
                .write(&TransactionHistoryEntry {
                    ledger_seq: seq,
                    tx_set: vec![vec![seq as u8; 16]],
                })
                .unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = RecordReader::<TransactionHistoryEntry>::open(&path).unwrap();
        let mut count = 0;
        while let Some(entry) = reader.read().unwrap() {
            count += 1;
            assert_eq!(entry.ledger_seq, count);
        }
        assert_eq!(count, 49);
    }

    #[test]
    fn test_truncated_record_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.dat");

        let mut writer = RecordWriter::create(&path, false).unwrap();
        writer.write(&TransactionHistoryEntry::empty(1)).unwrap();
        writer.write(&TransactionHistoryEntry::empty(2)).unwrap();
        writer.finalize().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut reader = RecordReader::<TransactionHistoryEntry>::open(&path).unwrap();
        assert!(reader.read().unwrap().is_some());
        assert!(matches!(reader.read(), Err(StreamError::UnexpectedEof)));
    }

    #[test]
    fn test_corrupt_record_fails_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.dat");

        let mut writer = RecordWriter::create(&path, false).unwrap();
        writer
            .write(&TransactionHistoryEntry {
                ledger_seq: 9,
                tx_set: vec![b"payload".to_vec()],
            })
            .unwrap();
        writer.finalize().unwrap();

        // Flip a payload byte past the header and length prefix.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();

        let mut reader = RecordReader::<TransactionHistoryEntry>::open(&path).unwrap();
        assert!(matches!(
            reader.read(),
            Err(StreamError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_prefix_rejected_before_allocation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.dat");

        // Valid header followed by a corrupt length prefix claiming an
        // absurd record size.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let mut reader = RecordReader::<TransactionHistoryEntry>::open(&path).unwrap();
        assert!(matches!(reader.read(), Err(StreamError::Codec(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        std::fs::write(&path, b"XXXX12345678").unwrap();
        assert!(matches!(
            RecordReader::<TransactionHistoryEntry>::open(&path),
            Err(StreamError::InvalidMagic)
        ));
    }
}
