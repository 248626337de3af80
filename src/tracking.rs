//! In-memory tracking state: producer dedup sequences, consumer
//! offsets and per-id timestamps.
//!
//! Tracking data travels inside the log itself. USER chunks carry
//! deltas in their trailer, TRK_DELTA chunks carry standalone deltas,
//! and on segment rollover the writer embeds a full TRK_SNAPSHOT so a
//! scan of the newest segment always reconstructs the complete state.

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::directory;
use crate::store::format::{
    parse_tracking, ChunkHeader, ChunkType, EntryIter, ParsedEntry, TrackingEntry, TrackingType,
    CHUNK_HEADER_SIZE, LOG_HEADER_SIZE,
};
use crate::tools;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Distinct tracking ids retained per category; further ids are
    /// dropped with a warning.
    pub max_entries: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TrackingState {
    sequences: HashMap<Vec<u8>, u64>,
    offsets: HashMap<Vec<u8>, u64>,
    timestamps: HashMap<Vec<u8>, i64>,
    config: TrackingConfig,
}

impl TrackingState {
    pub fn init(snapshot: Option<&[u8]>, config: TrackingConfig) -> Result<Self> {
        let mut state = Self {
            config,
            ..Default::default()
        };
        if let Some(bytes) = snapshot {
            state.apply(parse_tracking(bytes)?);
        }
        Ok(state)
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty() && self.offsets.is_empty() && self.timestamps.is_empty()
    }

    pub fn sequence(&self, id: &[u8]) -> Option<u64> {
        self.sequences.get(id).copied()
    }

    pub fn offset(&self, id: &[u8]) -> Option<u64> {
        self.offsets.get(id).copied()
    }

    pub fn timestamp(&self, id: &[u8]) -> Option<i64> {
        self.timestamps.get(id).copied()
    }

    fn apply(&mut self, entries: Vec<TrackingEntry>) {
        for entry in entries {
            let map_len = match entry.kind {
                TrackingType::Sequence => self.sequences.len(),
                TrackingType::Offset => self.offsets.len(),
                TrackingType::Timestamp => self.timestamps.len(),
            };
            let known = match entry.kind {
                TrackingType::Sequence => self.sequences.contains_key(&entry.id),
                TrackingType::Offset => self.offsets.contains_key(&entry.id),
                TrackingType::Timestamp => self.timestamps.contains_key(&entry.id),
            };
            if !known && map_len >= self.config.max_entries {
                warn!(
                    "tracking table full ({} ids), dropping id {:?}",
                    map_len, entry.id
                );
                continue;
            }
            match entry.kind {
                TrackingType::Sequence => {
                    self.sequences.insert(entry.id, entry.value);
                }
                TrackingType::Offset => {
                    self.offsets.insert(entry.id, entry.value);
                }
                TrackingType::Timestamp => {
                    self.timestamps.insert(entry.id, entry.value as i64);
                }
            }
        }
    }

    /// Apply trailer (or delta) bytes written with chunk `chunk_id`.
    pub fn append_trailer(&mut self, chunk_id: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let entries = parse_tracking(bytes)?;
        debug!(
            "applying {} tracking entries from chunk {}",
            entries.len(),
            chunk_id
        );
        self.apply(entries);
        Ok(())
    }

    /// Serialize the full state. Offsets below `first_offset` and
    /// timestamps below `first_timestamp` refer to retained-away data
    /// and are dropped from the snapshot.
    pub fn snapshot(&self, first_offset: u64, first_timestamp: i64) -> Vec<u8> {
        let mut entries: Vec<TrackingEntry> = Vec::new();
        for (id, value) in &self.sequences {
            entries.push(TrackingEntry {
                kind: TrackingType::Sequence,
                id: id.clone(),
                value: *value,
            });
        }
        for (id, value) in &self.offsets {
            if *value < first_offset {
                continue;
            }
            entries.push(TrackingEntry {
                kind: TrackingType::Offset,
                id: id.clone(),
                value: *value,
            });
        }
        for (id, value) in &self.timestamps {
            if *value < first_timestamp {
                continue;
            }
            entries.push(TrackingEntry {
                kind: TrackingType::Timestamp,
                id: id.clone(),
                value: *value as u64,
            });
        }
        entries.sort_by(|a, b| (a.kind as u8, &a.id).cmp(&(b.kind as u8, &b.id)));
        let mut buf = Vec::new();
        for entry in &entries {
            entry.encode_into(&mut buf);
        }
        buf
    }
}

/// Rebuild tracking state by scanning the chunks of the newest segment.
///
/// Snapshot interleaving at rollover guarantees that a snapshot sits at
/// the head of every segment created while tracking state existed, so
/// one segment is sufficient.
pub fn recover(dir: &std::path::Path, config: TrackingConfig) -> Result<TrackingState> {
    let index_files = directory::sorted_index_files(dir)?;
    let last_index = match index_files.last() {
        Some(path) => path,
        None => return TrackingState::init(None, config),
    };
    let segment_path = directory::segment_path_for(last_index);
    let segment = tools::open_read(&segment_path)?;

    let mut state = TrackingState::init(None, config)?;
    let mut pos = LOG_HEADER_SIZE;
    loop {
        let mut head_buf = [0u8; CHUNK_HEADER_SIZE];
        if tools::pread_some(&segment, &mut head_buf, pos)? < CHUNK_HEADER_SIZE {
            break;
        }
        let header = ChunkHeader::decode(&head_buf)?;
        let data_pos = pos + CHUNK_HEADER_SIZE as u64 + header.filter_size as u64;
        match header.chunk_type {
            ChunkType::TrackingSnapshot | ChunkType::TrackingDelta => {
                let mut data = vec![0u8; header.data_size as usize];
                tools::pread_exact(&segment, &mut data, data_pos)?;
                for entry in EntryIter::new(&data, header.chunk_id) {
                    match entry? {
                        ParsedEntry::Record { data: body, .. } => {
                            if header.chunk_type == ChunkType::TrackingSnapshot {
                                state = TrackingState::init(Some(body), state.config.clone())?;
                            } else {
                                state.append_trailer(header.chunk_id, body)?;
                            }
                        }
                        ParsedEntry::SubBatch { .. } => {
                            return Err(StoreError::InvalidChunkHeader);
                        }
                    }
                }
            }
            ChunkType::User => {
                if header.trailer_size > 0 {
                    let mut trailer = vec![0u8; header.trailer_size as usize];
                    tools::pread_exact(&segment, &mut trailer, data_pos + header.data_size as u64)?;
                    state.append_trailer(header.chunk_id, &trailer)?;
                }
            }
        }
        pos += header.total_size();
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trip() {
        let mut state = TrackingState::init(None, TrackingConfig::default()).unwrap();
        let mut delta = Vec::new();
        TrackingEntry {
            kind: TrackingType::Sequence,
            id: b"producer".to_vec(),
            value: 12,
        }
        .encode_into(&mut delta);
        TrackingEntry {
            kind: TrackingType::Offset,
            id: b"group".to_vec(),
            value: 400,
        }
        .encode_into(&mut delta);
        state.append_trailer(5, &delta).unwrap();
        assert!(!state.is_empty());

        let snapshot = state.snapshot(0, 0);
        let restored = TrackingState::init(Some(&snapshot), TrackingConfig::default()).unwrap();
        assert_eq!(restored.sequence(b"producer"), Some(12));
        assert_eq!(restored.offset(b"group"), Some(400));
    }

    #[test]
    fn snapshot_drops_stale_offsets() {
        let mut state = TrackingState::init(None, TrackingConfig::default()).unwrap();
        let mut delta = Vec::new();
        TrackingEntry {
            kind: TrackingType::Offset,
            id: b"old".to_vec(),
            value: 10,
        }
        .encode_into(&mut delta);
        TrackingEntry {
            kind: TrackingType::Offset,
            id: b"new".to_vec(),
            value: 500,
        }
        .encode_into(&mut delta);
        state.append_trailer(0, &delta).unwrap();

        let snapshot = state.snapshot(100, 0);
        let restored = TrackingState::init(Some(&snapshot), TrackingConfig::default()).unwrap();
        assert_eq!(restored.offset(b"old"), None);
        assert_eq!(restored.offset(b"new"), Some(500));
    }
}
