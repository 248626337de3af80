//! Operations over the set of segment pairs in a log directory.
//!
//! Pair file names encode the first chunk id zero-padded to 20 digits,
//! so lexicographic file name order equals chunk-id order and a plain
//! sorted listing walks the log chronologically.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Result, StoreError};
use crate::store::format::{IndexRecord, INDEX_RECORD_SIZE, LOG_HEADER_SIZE};
use crate::tools;

pub const SEGMENT_EXTENSION: &str = "segment";
pub const INDEX_EXTENSION: &str = "index";

pub fn segment_path(dir: &Path, first_chunk_id: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", first_chunk_id, SEGMENT_EXTENSION))
}

pub fn index_path(dir: &Path, first_chunk_id: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", first_chunk_id, INDEX_EXTENSION))
}

/// The segment file sharing an index file's name prefix.
pub fn segment_path_for(index_path: &Path) -> PathBuf {
    index_path.with_extension(SEGMENT_EXTENSION)
}

pub fn index_path_for(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(INDEX_EXTENSION)
}

/// Extract the first chunk id encoded in a pair file name.
pub fn first_chunk_id_of(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// All index files of the log, sorted by first chunk id.
pub fn sorted_index_files(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(tools::list_sorted(dir, INDEX_EXTENSION)?)
}

/// First chunk ids of all pairs, ascending.
pub fn sorted_first_chunk_ids(dir: &Path) -> Result<Vec<u64>> {
    Ok(sorted_index_files(dir)?
        .iter()
        .filter_map(|p| first_chunk_id_of(p))
        .collect())
}

/// The pair that covers `chunk_id`: the greatest first chunk id at or
/// below the target. `None` when the log is empty or the target is
/// older than the oldest pair.
pub fn find_segment_for(dir: &Path, chunk_id: u64) -> Result<Option<u64>> {
    Ok(sorted_first_chunk_ids(dir)?
        .into_iter()
        .take_while(|first| *first <= chunk_id)
        .last())
}

/// Delete both files of a pair. Already-deleted files are ignored so
/// concurrent retention runs stay idempotent.
pub fn delete_pair(dir: &Path, first_chunk_id: u64) -> Result<()> {
    debug!("deleting segment pair {:020}", first_chunk_id);
    for path in &[
        index_path(dir, first_chunk_id),
        segment_path(dir, first_chunk_id),
    ] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Read every record of one index file.
pub fn read_index_records(index_path: &Path) -> Result<Vec<IndexRecord>> {
    let bytes = match fs::read(index_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::MissingFile(index_path.to_owned()))
        }
        Err(err) => return Err(err.into()),
    };
    let mut records = Vec::new();
    let mut pos = LOG_HEADER_SIZE as usize;
    while pos + INDEX_RECORD_SIZE <= bytes.len() {
        records.push(IndexRecord::decode(&bytes[pos..pos + INDEX_RECORD_SIZE])?);
        pos += INDEX_RECORD_SIZE;
    }
    Ok(records)
}

/// Summary of a log directory: the stored chunk-id range and the last
/// chunk id written in each epoch. This is what an acceptor offers its
/// leader for reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct Overview {
    /// First and last chunk id, `None` for an empty log.
    pub range: Option<(u64, u64)>,
    /// `(epoch, last chunk id in that epoch)`, ascending by epoch.
    pub epoch_offsets: Vec<(u64, u64)>,
}

pub fn overview(dir: &Path) -> Result<Overview> {
    let mut first = None;
    let mut last = None;
    let mut epoch_offsets: Vec<(u64, u64)> = Vec::new();

    for index_path in sorted_index_files(dir)? {
        for record in read_index_records(&index_path)? {
            if first.is_none() {
                first = Some(record.chunk_id);
            }
            last = Some(record.chunk_id);
            match epoch_offsets.last_mut() {
                Some((epoch, offset)) if *epoch == record.epoch => *offset = record.chunk_id,
                _ => epoch_offsets.push((record.epoch, record.chunk_id)),
            }
        }
    }

    Ok(Overview {
        range: first.and_then(|f| last.map(|l| (f, l))),
        epoch_offsets,
    })
}
