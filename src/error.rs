use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the storage engine.
///
/// Range errors (`OffsetOutOfRange`, `NoIndexFile`, `RetriesExhausted`)
/// are recoverable and returned to the caller. `MissingFile` is a
/// transient race with retention and is retried internally where a fresh
/// directory listing can resolve it. Everything else indicates either a
/// protocol violation between replicas or on-disk corruption and is not
/// recoverable.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("offset {offset} out of range {range:?}")]
    OffsetOutOfRange { offset: u64, range: (u64, u64) },

    #[error("no index file found")]
    NoIndexFile,

    #[error("directory listing retries exhausted")]
    RetriesExhausted,

    #[error("file vanished: {0:?}")]
    MissingFile(PathBuf),

    #[error("on-disk epoch {found} exceeds configured epoch {configured}")]
    InvalidEpoch { found: u64, configured: u64 },

    #[error("accepted chunk id {seen} does not match expected {expected}")]
    AcceptOutOfOrder { seen: u64, expected: u64 },

    #[error("streamed chunk id {found} does not match expected {expected}")]
    UnexpectedChunkId { found: u64, expected: u64 },

    #[error("crc validation failed for chunk {chunk_id}")]
    CrcMismatch { chunk_id: u64 },

    #[error("invalid chunk header")]
    InvalidChunkHeader,

    #[error("chunk epoch mismatch: leader reports {expected:?}, local {actual:?}")]
    InvalidLastOffsetEpoch {
        expected: (u64, u64),
        actual: Option<(u64, u64)>,
    },

    #[error("segment {0:?} is corrupted beyond repair")]
    CorruptedSegment(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for StoreError {
    fn from(err: nix::Error) -> Self {
        match err.as_errno() {
            Some(errno) => StoreError::Io(std::io::Error::from_raw_os_error(errno as i32)),
            None => StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
