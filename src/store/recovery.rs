//! Startup repair of a partially written log tail.
//!
//! A crash can leave a fractional index record, index records pointing
//! past the segment EOF, or chunk bytes without their index record.
//! Repair walks the last index backwards, drops everything that does
//! not validate against the segment contents, and truncates both files
//! to the last chunk that checks out. Earlier records are immutable and
//! never touched, so running repair twice leaves the directory bitwise
//! identical.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::chunk::crc32;
use crate::store::directory;
use crate::store::format::{
    log_header, ChunkHeader, IndexRecord, CHUNK_HEADER_SIZE, INDEX_MAGIC, INDEX_RECORD_SIZE,
    LOG_HEADER_SIZE, SEGMENT_MAGIC,
};
use crate::store::segment::{align_index_eof, SegmentAppender};
use crate::store::writer::{LastChunk, TailInfo};
use crate::tools;

pub struct RecoveredLog {
    /// First chunk id of the pair the writer appends to.
    pub last_first_chunk_id: u64,
    pub tail: TailInfo,
    pub first_chunk_id: Option<u64>,
    pub first_timestamp: Option<i64>,
    pub segment_count: u32,
}

enum TailRepair {
    Valid(LastChunk),
    Empty,
}

/// Validate the chunk an index record points at: header in bounds and
/// well-formed, identity fields matching, data region CRC intact.
fn validate_record(
    segment: &std::fs::File,
    segment_len: u64,
    record: &IndexRecord,
) -> Result<Option<(LastChunk, u64)>> {
    let pos = record.file_pos as u64;
    if pos < LOG_HEADER_SIZE || pos + CHUNK_HEADER_SIZE as u64 > segment_len {
        return Ok(None);
    }
    let mut head = [0u8; CHUNK_HEADER_SIZE];
    tools::pread_exact(segment, &mut head, pos)?;
    let header = match ChunkHeader::decode(&head) {
        Ok(header) => header,
        Err(_) => return Ok(None),
    };
    if header.chunk_id != record.chunk_id
        || header.epoch != record.epoch
        || header.timestamp != record.timestamp
        || header.chunk_type != record.chunk_type
    {
        return Ok(None);
    }
    if pos + header.total_size() > segment_len {
        return Ok(None);
    }
    let mut data = vec![0u8; header.data_size as usize];
    tools::pread_exact(
        segment,
        &mut data,
        pos + CHUNK_HEADER_SIZE as u64 + header.filter_size as u64,
    )?;
    if crc32(&data) != header.crc {
        return Ok(None);
    }
    let last = LastChunk {
        epoch: header.epoch,
        chunk_id: header.chunk_id,
        timestamp: header.timestamp,
        num_records: header.num_records,
    };
    Ok(Some((last, pos + header.total_size())))
}

/// Forward scan used when the index holds no usable record but the
/// segment may still contain chunks.
fn scan_segment(segment: &std::fs::File, segment_len: u64) -> Result<Vec<(u64, ChunkHeader)>> {
    let mut chunks = Vec::new();
    let mut pos = LOG_HEADER_SIZE;
    while pos + CHUNK_HEADER_SIZE as u64 <= segment_len {
        let mut head = [0u8; CHUNK_HEADER_SIZE];
        tools::pread_exact(segment, &mut head, pos)?;
        let header = match ChunkHeader::decode(&head) {
            Ok(header) => header,
            Err(_) => break,
        };
        if pos + header.total_size() > segment_len {
            break;
        }
        let mut data = vec![0u8; header.data_size as usize];
        tools::pread_exact(
            segment,
            &mut data,
            pos + CHUNK_HEADER_SIZE as u64 + header.filter_size as u64,
        )?;
        if crc32(&data) != header.crc {
            break;
        }
        chunks.push((pos, header));
        pos += header.total_size();
    }
    Ok(chunks)
}

fn repair_tail_pair(dir: &Path, first_chunk_id: u64) -> Result<TailRepair> {
    let index_path = directory::index_path(dir, first_chunk_id);
    let segment_path = directory::segment_path(dir, first_chunk_id);

    let index = OpenOptions::new().read(true).write(true).open(&index_path)?;
    let segment = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment_path)?;
    let segment_len = segment.metadata()?.len();

    // drop a fractional trailing record
    let mut end = align_index_eof(index.metadata()?.len());
    if end != index.metadata()?.len() {
        debug!("dropping fractional index tail of {:?}", index_path);
        index.set_len(end)?;
    }

    while end >= LOG_HEADER_SIZE + INDEX_RECORD_SIZE as u64 {
        let off = end - INDEX_RECORD_SIZE as u64;
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        tools::pread_exact(&index, &mut buf, off)?;

        let valid = if IndexRecord::is_zero(&buf) {
            None
        } else {
            match IndexRecord::decode(&buf) {
                Ok(record) => validate_record(&segment, segment_len, &record)?,
                Err(_) => None,
            }
        };

        match valid {
            Some((last, end_pos)) => {
                if end != index.metadata()?.len() {
                    info!(
                        "repair: truncating {:?} to {} records",
                        index_path,
                        (end - LOG_HEADER_SIZE) / INDEX_RECORD_SIZE as u64
                    );
                }
                index.set_len(end)?;
                if end_pos != segment_len {
                    info!(
                        "repair: truncating {:?} from {} to {} bytes",
                        segment_path, segment_len, end_pos
                    );
                    segment.set_len(end_pos)?;
                }
                return Ok(TailRepair::Valid(last));
            }
            None => {
                end = off;
            }
        }
    }

    // no usable index record; the segment may still hold valid chunks
    let chunks = scan_segment(&segment, segment_len)?;
    if chunks.is_empty() {
        return Ok(TailRepair::Empty);
    }
    info!(
        "repair: rebuilding {:?} from {} segment chunks",
        index_path,
        chunks.len()
    );
    let mut index = index;
    index.set_len(LOG_HEADER_SIZE)?;
    index.seek(SeekFrom::Start(LOG_HEADER_SIZE))?;
    let mut last = None;
    for (pos, header) in &chunks {
        let record = IndexRecord {
            chunk_id: header.chunk_id,
            timestamp: header.timestamp,
            epoch: header.epoch,
            file_pos: *pos as u32,
            chunk_type: header.chunk_type,
        };
        index.write_all(&record.encode())?;
        last = Some((
            LastChunk {
                epoch: header.epoch,
                chunk_id: header.chunk_id,
                timestamp: header.timestamp,
                num_records: header.num_records,
            },
            pos + header.total_size(),
        ));
    }
    let (last, end_pos) = last.unwrap();
    segment.set_len(end_pos)?;
    Ok(TailRepair::Valid(last))
}

fn reset_pair(dir: &Path, first_chunk_id: u64) -> Result<()> {
    for (path, magic) in &[
        (directory::segment_path(dir, first_chunk_id), SEGMENT_MAGIC),
        (directory::index_path(dir, first_chunk_id), INDEX_MAGIC),
    ] {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&log_header(magic))?;
    }
    Ok(())
}

fn first_metadata(dir: &Path) -> Result<(Option<u64>, Option<i64>)> {
    for index_path in directory::sorted_index_files(dir)? {
        let index = tools::open_read(&index_path)?;
        if let Some(record) = crate::store::segment::first_index_record(&index)? {
            return Ok((Some(record.chunk_id), Some(record.timestamp)));
        }
    }
    Ok((None, None))
}

/// Repair the tail and load the writer's starting state.
///
/// An empty directory gets its first pair, named by `initial_offset`
/// (the acceptor's attach point) or zero.
pub fn repair_and_load(dir: &Path, initial_offset: Option<u64>) -> Result<RecoveredLog> {
    std::fs::create_dir_all(dir)?;
    let mut retreats = 0u32;
    loop {
        let ids = directory::sorted_first_chunk_ids(dir)?;
        let last_id = match ids.last() {
            None => {
                let first = initial_offset.unwrap_or(0);
                info!("initializing empty log at chunk id {}", first);
                SegmentAppender::create(dir, first)?;
                return Ok(RecoveredLog {
                    last_first_chunk_id: first,
                    tail: TailInfo {
                        next_chunk_id: first,
                        last_chunk: None,
                    },
                    first_chunk_id: None,
                    first_timestamp: None,
                    segment_count: 1,
                });
            }
            Some(id) => *id,
        };

        match repair_tail_pair(dir, last_id)? {
            TailRepair::Valid(last) => {
                let (first_chunk_id, first_timestamp) = first_metadata(dir)?;
                return Ok(RecoveredLog {
                    last_first_chunk_id: last_id,
                    tail: TailInfo {
                        next_chunk_id: last.chunk_id + last.num_records as u64,
                        last_chunk: Some(last),
                    },
                    first_chunk_id,
                    first_timestamp,
                    segment_count: ids.len() as u32,
                });
            }
            TailRepair::Empty => {
                if ids.len() == 1 {
                    reset_pair(dir, last_id)?;
                    return Ok(RecoveredLog {
                        last_first_chunk_id: last_id,
                        tail: TailInfo {
                            next_chunk_id: last_id,
                            last_chunk: None,
                        },
                        first_chunk_id: None,
                        first_timestamp: None,
                        segment_count: 1,
                    });
                }
                retreats += 1;
                if retreats > 2 {
                    return Err(StoreError::CorruptedSegment(directory::segment_path(
                        dir, last_id,
                    )));
                }
                info!("repair: dropping empty tail pair {:020}", last_id);
                directory::delete_pair(dir, last_id)?;
            }
        }
    }
}
