//! This module implements the chunk log storage and access layer.
//!
//! # Data format
//!
//! A log is a directory of segment pairs. The `.segment` file starts
//! with an 8-byte magic header followed by a contiguous sequence of
//! chunks; the `.index` file starts with the same sized header followed
//! by one fixed 29-byte record per chunk. Both files are named by the
//! chunk id of the first chunk they hold, zero-padded to 20 digits, so
//! sorting file names sorts the log.
//!
//! A chunk is the atomic unit of write, replication and read. It
//! carries a 56-byte header, an optional Bloom filter, the framed entry
//! data and a tracking trailer. The CRC32 in the header covers exactly
//! the data region. A chunk's id is the offset of its first record;
//! offsets are dense, so the next chunk's id is always
//! `chunk_id + num_records`.
//!
//! # Writing
//!
//! There is exactly one writer task per log. It assembles chunks from
//! local entries or accepts pre-framed chunks from replication, appends
//! to the segment first and the index after, and publishes the new last
//! chunk id through a shared atomic cell. Readers never parse a header
//! past that cell, which is the only synchronization between tasks;
//! files carry no locks.
//!
//! # Reading
//!
//! Readers own their file handle and cursor. A data reader streams
//! every chunk verbatim to a replica; an offset reader streams
//! committed user chunks to consumers, optionally skipping chunks whose
//! Bloom filter cannot match. Delivery goes through `sendfile` on plain
//! TCP sockets and a buffered copy on TLS.
//!
//! # Recovery and reconciliation
//!
//! On startup the tail of the last index is validated backwards against
//! the segment and both files are truncated to the last chunk that
//! checks out; the repair is idempotent. A follower additionally
//! reconciles against its leader's epoch vector, truncating to the
//! largest shared prefix.
//!
//! # Retention
//!
//! Whole segment pairs are deleted oldest-first by size or age limits,
//! always preserving the most recent pair. Readers racing a deletion
//! retry against a fresh directory listing.

pub mod acceptor;
pub mod attach;
pub mod chunk;
pub mod config;
pub mod directory;
pub mod format;
pub mod reader;
pub mod recovery;
pub mod segment;
pub mod writer;

pub use attach::{AttachPoint, AttachSpec};
pub use chunk::EntryPayload;
pub use config::{ChunkSelector, CounterSpec, LogConfig, ReaderOptions};
pub use format::{ChunkHeader, ChunkType};
pub use reader::{LogReader, ReadRecord, ReadersCounterFun};
pub use writer::{LastChunk, LogWriter, TailInfo};
