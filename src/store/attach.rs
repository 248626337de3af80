//! Resolution of reader attach specs to a concrete log position.
//!
//! Resolution races against retention: any file read here may hit a
//! path that was just deleted. Those surface as `MissingFile` and the
//! retry wrapper re-resolves against a fresh directory listing up to
//! three times.

use std::path::Path;

use log::debug;

use crate::error::{Result, StoreError};
use crate::store::directory;
use crate::store::format::{ChunkType, LOG_HEADER_SIZE};
use crate::store::segment;
use crate::tools;

/// Where a reader wants to start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttachSpec {
    /// Oldest chunk still stored.
    First,
    /// The most recent USER chunk, falling back to `Next`.
    Last,
    /// Immediately after the last chunk; delivery starts with the next
    /// write.
    Next,
    /// Exact offset; out-of-range values are an error.
    Abs(u64),
    /// Offset clamped into the stored range.
    Offset(u64),
    /// First chunk with a timestamp at or above this value.
    Timestamp(i64),
}

/// A resolved attach position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttachPoint {
    pub segment_first_chunk_id: u64,
    pub chunk_id: u64,
    pub file_pos: u64,
}

fn point(segment_first_chunk_id: u64, chunk_id: u64, file_pos: u64) -> AttachPoint {
    AttachPoint {
        segment_first_chunk_id,
        chunk_id,
        file_pos,
    }
}

fn name_of(path: &Path) -> Result<u64> {
    directory::first_chunk_id_of(path).ok_or(StoreError::InvalidChunkHeader)
}

fn resolve_first(index_files: &[std::path::PathBuf]) -> Result<AttachPoint> {
    let path = &index_files[0];
    let first_id = name_of(path)?;
    let index = tools::open_read(path)?;
    match segment::first_index_record(&index)? {
        Some(record) => Ok(point(first_id, record.chunk_id, record.file_pos as u64)),
        None => Ok(point(first_id, first_id, LOG_HEADER_SIZE)),
    }
}

fn resolve_next(index_files: &[std::path::PathBuf]) -> Result<AttachPoint> {
    let path = index_files.last().unwrap();
    let first_id = name_of(path)?;
    let index = tools::open_read(path)?;
    match segment::last_index_record(&index)? {
        Some(record) => {
            let segment_path = directory::segment_path_for(path);
            let segment_file = tools::open_read(&segment_path)?;
            let header = segment::read_chunk_header(&segment_file, record.file_pos as u64)?;
            Ok(point(
                first_id,
                header.next_chunk_id(),
                record.file_pos as u64 + header.total_size(),
            ))
        }
        None => Ok(point(first_id, first_id, LOG_HEADER_SIZE)),
    }
}

fn resolve_last(index_files: &[std::path::PathBuf]) -> Result<AttachPoint> {
    for path in index_files.iter().rev() {
        let records = directory::read_index_records(path)?;
        if let Some(record) = records
            .iter()
            .rev()
            .find(|r| r.chunk_type == ChunkType::User)
        {
            return Ok(point(name_of(path)?, record.chunk_id, record.file_pos as u64));
        }
    }
    resolve_next(index_files)
}

/// Stored range as `(first, next)` where `next` is one past the last
/// stored record's chunk id.
fn log_range(index_files: &[std::path::PathBuf]) -> Result<(u64, u64)> {
    let first = resolve_first(index_files)?.chunk_id;
    let next = resolve_next(index_files)?.chunk_id;
    Ok((first, next))
}

fn resolve_offset(index_files: &[std::path::PathBuf], target: u64) -> Result<AttachPoint> {
    let (first, next) = log_range(index_files)?;
    if target <= first {
        return resolve_first(index_files);
    }
    if target >= next {
        return resolve_next(index_files);
    }

    let covering = index_files
        .iter()
        .filter(|path| directory::first_chunk_id_of(path).map_or(false, |id| id <= target))
        .last()
        .ok_or(StoreError::NoIndexFile)?;
    let first_id = name_of(covering)?;

    let mut found = None;
    for record in directory::read_index_records(covering)? {
        if record.chunk_id > target {
            break;
        }
        found = Some(record);
    }
    match found {
        Some(record) => Ok(point(first_id, record.chunk_id, record.file_pos as u64)),
        None => Ok(point(first_id, first_id, LOG_HEADER_SIZE)),
    }
}

fn resolve_timestamp(index_files: &[std::path::PathBuf], target: i64) -> Result<AttachPoint> {
    // first chunk of the next-newer segment while walking backwards
    let mut candidate: Option<AttachPoint> = None;

    for path in index_files.iter().rev() {
        let index = tools::open_read(path)?;
        let first_record = segment::first_index_record(&index)?;
        let last_record = segment::last_index_record(&index)?;
        let (first_record, last_record) = match (first_record, last_record) {
            (Some(first), Some(last)) => (first, last),
            _ => continue, // an empty tail pair
        };

        if target > last_record.timestamp {
            return match candidate {
                Some(candidate) => Ok(candidate),
                None => resolve_next(index_files),
            };
        }
        if target >= first_record.timestamp {
            let first_id = name_of(path)?;
            for record in directory::read_index_records(path)? {
                if record.timestamp >= target {
                    return Ok(point(first_id, record.chunk_id, record.file_pos as u64));
                }
            }
            // records shrank under us; retry against a fresh listing
            return Err(StoreError::MissingFile(path.clone()));
        }
        candidate = Some(point(
            name_of(path)?,
            first_record.chunk_id,
            first_record.file_pos as u64,
        ));
    }

    // older than everything stored
    match candidate {
        Some(candidate) => Ok(candidate),
        None => resolve_next(index_files),
    }
}

/// Resolve once against the current directory contents.
pub fn resolve(dir: &Path, spec: AttachSpec) -> Result<AttachPoint> {
    let index_files = directory::sorted_index_files(dir)?;
    if index_files.is_empty() {
        return Err(StoreError::NoIndexFile);
    }
    match spec {
        AttachSpec::First => resolve_first(&index_files),
        AttachSpec::Next => resolve_next(&index_files),
        AttachSpec::Last => resolve_last(&index_files),
        AttachSpec::Offset(target) => resolve_offset(&index_files, target),
        AttachSpec::Abs(target) => {
            let (first, next) = log_range(&index_files)?;
            if target < first || target > next {
                return Err(StoreError::OffsetOutOfRange {
                    offset: target,
                    range: (first, next),
                });
            }
            resolve_offset(&index_files, target)
        }
        AttachSpec::Timestamp(target) => resolve_timestamp(&index_files, target),
    }
}

/// Resolve, retrying with a fresh listing when retention deletes a file
/// mid-scan.
pub fn resolve_with_retry(dir: &Path, spec: AttachSpec) -> Result<AttachPoint> {
    for attempt in 0..3 {
        match resolve(dir, spec) {
            Err(StoreError::MissingFile(path)) => {
                debug!(
                    "attach resolution lost {:?} (attempt {}), relisting",
                    path, attempt
                );
            }
            other => return other,
        }
    }
    Err(StoreError::RetriesExhausted)
}
