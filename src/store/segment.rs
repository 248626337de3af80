//! The (segment, index) file pair.
//!
//! The segment file holds the contiguous chunk byte stream after an
//! 8-byte magic header; the index file holds one 29-byte record per
//! chunk. The writer appends to the segment first and the index after,
//! so a reader that observes an index record will always find the chunk
//! bytes on disk.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::store::directory;
use crate::store::format::{
    check_log_header, log_header, ChunkHeader, IndexRecord, CHUNK_HEADER_SIZE, INDEX_MAGIC,
    INDEX_RECORD_SIZE, LOG_HEADER_SIZE, SEGMENT_MAGIC,
};
use crate::tools;

/// Round a concurrently observed index size down to a record boundary.
///
/// Another task may be extending the file while we stat it, so an "eof"
/// position is only trustworthy after aligning to
/// `header + k * record_size`.
pub fn align_index_eof(len: u64) -> u64 {
    if len <= LOG_HEADER_SIZE {
        LOG_HEADER_SIZE
    } else {
        len - ((len - LOG_HEADER_SIZE) % INDEX_RECORD_SIZE as u64)
    }
}

/// Read and validate a chunk header at a segment position.
pub fn read_chunk_header(file: &File, pos: u64) -> Result<ChunkHeader> {
    let mut buf = [0u8; CHUNK_HEADER_SIZE];
    tools::pread_exact(file, &mut buf, pos)?;
    ChunkHeader::decode(&buf)
}

pub fn first_index_record(index: &File) -> Result<Option<IndexRecord>> {
    let mut buf = [0u8; INDEX_RECORD_SIZE];
    match tools::pread_some(index, &mut buf, LOG_HEADER_SIZE)? {
        n if n < INDEX_RECORD_SIZE => Ok(None),
        _ => Ok(Some(IndexRecord::decode(&buf)?)),
    }
}

pub fn last_index_record(index: &File) -> Result<Option<IndexRecord>> {
    let len = align_index_eof(index.metadata()?.len());
    if len < LOG_HEADER_SIZE + INDEX_RECORD_SIZE as u64 {
        return Ok(None);
    }
    let mut buf = [0u8; INDEX_RECORD_SIZE];
    tools::pread_exact(index, &mut buf, len - INDEX_RECORD_SIZE as u64)?;
    Ok(Some(IndexRecord::decode(&buf)?))
}

fn open_pair_file(path: &Path, magic: &[u8; 4]) -> Result<(File, u64)> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len < LOG_HEADER_SIZE {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&log_header(magic))?;
        return Ok((file, LOG_HEADER_SIZE));
    }
    let mut head = [0u8; LOG_HEADER_SIZE as usize];
    tools::pread_exact(&file, &mut head, 0)?;
    check_log_header(&head, magic)?;
    file.seek(SeekFrom::Start(len))?;
    Ok((file, len))
}

/// Writer-side handle on the current segment pair, positioned at EOF.
pub struct SegmentAppender {
    pub first_chunk_id: u64,
    pub segment_path: PathBuf,
    pub index_path: PathBuf,
    segment: File,
    index: File,
    /// Segment size in bytes, including the 8-byte header.
    pub size: u64,
    pub chunk_count: u32,
}

impl SegmentAppender {
    /// Create a fresh pair named by its first chunk id.
    pub fn create(dir: &Path, first_chunk_id: u64) -> Result<Self> {
        let segment_path = directory::segment_path(dir, first_chunk_id);
        let index_path = directory::index_path(dir, first_chunk_id);

        let mut segment = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&segment_path)?;
        segment.write_all(&log_header(SEGMENT_MAGIC))?;

        let mut index = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&index_path)?;
        index.write_all(&log_header(INDEX_MAGIC))?;

        Ok(Self {
            first_chunk_id,
            segment_path,
            index_path,
            segment,
            index,
            size: LOG_HEADER_SIZE,
            chunk_count: 0,
        })
    }

    /// Open an existing pair for append. Missing or truncated file
    /// headers are rewritten (the repair path leaves empty pairs that
    /// way). The index size must already be record-aligned.
    pub fn open(dir: &Path, first_chunk_id: u64) -> Result<Self> {
        let segment_path = directory::segment_path(dir, first_chunk_id);
        let index_path = directory::index_path(dir, first_chunk_id);

        let (segment, size) = open_pair_file(&segment_path, SEGMENT_MAGIC)?;
        let (index, index_len) = open_pair_file(&index_path, INDEX_MAGIC)?;
        if index_len != align_index_eof(index_len) {
            return Err(StoreError::CorruptedSegment(index_path));
        }
        let chunk_count = ((index_len - LOG_HEADER_SIZE) / INDEX_RECORD_SIZE as u64) as u32;

        Ok(Self {
            first_chunk_id,
            segment_path,
            index_path,
            segment,
            index,
            size,
            chunk_count,
        })
    }

    /// Append a fully framed chunk, then its index record.
    ///
    /// Returns the segment position the chunk was written at.
    pub fn append_chunk(&mut self, bytes: &[u8], header: &ChunkHeader) -> Result<u32> {
        let file_pos = self.size as u32;

        self.segment.write_all(bytes)?;

        let record = IndexRecord {
            chunk_id: header.chunk_id,
            timestamp: header.timestamp,
            epoch: header.epoch,
            file_pos,
            chunk_type: header.chunk_type,
        };
        self.index.write_all(&record.encode())?;

        self.size += bytes.len() as u64;
        self.chunk_count += 1;
        Ok(file_pos)
    }

    pub fn segment_file(&self) -> &File {
        &self.segment
    }

    pub fn index_file(&self) -> &File {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_eof_alignment() {
        assert_eq!(align_index_eof(0), 8);
        assert_eq!(align_index_eof(8), 8);
        assert_eq!(align_index_eof(8 + 29), 37);
        assert_eq!(align_index_eof(8 + 29 + 13), 37);
        assert_eq!(align_index_eof(8 + 3 * 29), 8 + 3 * 29);
    }
}
