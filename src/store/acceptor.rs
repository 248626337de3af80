//! Follower reconciliation: truncate the local log to the largest
//! prefix shared with the leader.
//!
//! The leader offers its stored chunk-id range and an epoch vector,
//! `(epoch, last chunk id written in that epoch)`, newest first. The
//! follower walks that vector looking for a chunk it also has; the
//! first exact `(epoch, chunk id)` hit becomes the new local tail and
//! everything younger is deleted. No hit at all means the logs share
//! nothing and the follower starts fresh.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::Result;
use crate::store::directory;
use crate::store::segment;
use crate::store::format::{INDEX_RECORD_SIZE, LOG_HEADER_SIZE};
use crate::tools;

/// Identity of the last locally stored chunk.
fn local_last(dir: &Path) -> Result<Option<(u64, u64, u64)>> {
    for first_chunk_id in directory::sorted_first_chunk_ids(dir)?.iter().rev() {
        let index_path = directory::index_path(dir, *first_chunk_id);
        let index = tools::open_read(&index_path)?;
        if let Some(record) = segment::last_index_record(&index)? {
            let segment_path = directory::segment_path(dir, *first_chunk_id);
            let segment_file = tools::open_read(&segment_path)?;
            let header = segment::read_chunk_header(&segment_file, record.file_pos as u64)?;
            return Ok(Some((record.epoch, record.chunk_id, header.num_records as u64)));
        }
    }
    Ok(None)
}

fn local_range(dir: &Path) -> Result<Option<(u64, u64)>> {
    Ok(directory::overview(dir)?.range)
}

fn delete_all(dir: &Path) -> Result<()> {
    for first_chunk_id in directory::sorted_first_chunk_ids(dir)? {
        directory::delete_pair(dir, first_chunk_id)?;
    }
    Ok(())
}

fn surviving(dir: &Path) -> Result<Vec<PathBuf>> {
    directory::sorted_index_files(dir)
}

/// Truncate the pair holding `chunk_id` right after that chunk and
/// delete every younger pair.
fn truncate_at(dir: &Path, covering: u64, chunk_id: u64, record_slot: u64) -> Result<()> {
    let segment_path = directory::segment_path(dir, covering);
    let index_path = directory::index_path(dir, covering);

    let segment_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment_path)?;
    let index_file = OpenOptions::new().read(true).write(true).open(&index_path)?;

    let mut record_buf = [0u8; INDEX_RECORD_SIZE];
    let record_off = LOG_HEADER_SIZE + record_slot * INDEX_RECORD_SIZE as u64;
    tools::pread_exact(&index_file, &mut record_buf, record_off)?;
    let record = crate::store::format::IndexRecord::decode(&record_buf)?;
    let header = segment::read_chunk_header(&segment_file, record.file_pos as u64)?;

    info!(
        "acceptor: truncating log after chunk {} in segment {:020}",
        chunk_id, covering
    );
    segment_file.set_len(record.file_pos as u64 + header.total_size())?;
    index_file.set_len(record_off + INDEX_RECORD_SIZE as u64)?;

    for first_chunk_id in directory::sorted_first_chunk_ids(dir)? {
        if first_chunk_id > chunk_id {
            directory::delete_pair(dir, first_chunk_id)?;
        }
    }
    Ok(())
}

fn ranges_overlap(local: (u64, u64), remote: (u64, u64)) -> bool {
    local.0 <= remote.1 && remote.0 <= local.1
}

/// Reconcile the local log against the leader's offer.
///
/// Returns the surviving index files, oldest first; an empty list means
/// the follower should attach fresh at the leader's first offset.
pub fn truncate_to(
    dir: &Path,
    remote_range: Option<(u64, u64)>,
    epoch_offsets: &[(u64, u64)],
) -> Result<Vec<PathBuf>> {
    let mut vector: Vec<(u64, u64)> = epoch_offsets.to_vec();
    vector.sort_by(|a, b| b.cmp(a));

    for (epoch, chunk_id) in vector {
        let covering = match directory::find_segment_for(dir, chunk_id)? {
            Some(covering) => covering,
            None => continue,
        };

        let records = directory::read_index_records(&directory::index_path(dir, covering))?;
        let located = records
            .iter()
            .enumerate()
            .find(|(_, record)| record.chunk_id == chunk_id);

        match located {
            Some((slot, record)) if record.epoch == epoch => {
                truncate_at(dir, covering, chunk_id, slot as u64)?;
                return surviving(dir);
            }
            Some(_) => continue,
            None => {
                // `chunk_id` is past our end of log: the leader has
                // chunks we never saw. If our tail sits in the same
                // epoch we are a clean prefix and keep everything,
                // unless the ranges do not even overlap.
                if let Some((last_epoch, last_chunk_id, _)) = local_last(dir)? {
                    if last_epoch == epoch && last_chunk_id < chunk_id {
                        let overlap = match (local_range(dir)?, remote_range) {
                            (Some(local), Some(remote)) => ranges_overlap(local, remote),
                            _ => false,
                        };
                        if !overlap {
                            info!("acceptor: no shared range with leader, starting fresh");
                            delete_all(dir)?;
                            return Ok(Vec::new());
                        }
                        return surviving(dir);
                    }
                }
                continue;
            }
        }
    }

    // no epoch/offset pair matched anything local
    info!("acceptor: logs diverge everywhere, starting fresh");
    delete_all(dir)?;
    Ok(Vec::new())
}
