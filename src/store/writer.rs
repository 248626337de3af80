//! The single writer task of a log.
//!
//! Accepts either locally produced entries (`write`) or pre-framed
//! chunks from replication (`accept_chunk`), appends them to the
//! current segment pair, maintains the index and the shared cells, and
//! rolls to a new pair when the configured thresholds are reached.

use std::sync::Arc;

use log::{debug, info};

use crate::counters::{self, CounterSet, CHUNKS, FIRST_OFFSET, FIRST_TIMESTAMP, OFFSET, SEGMENTS};
use crate::error::{Result, StoreError};
use crate::retention::Runner;
use crate::shared::SharedCells;
use crate::store::chunk::{assemble, EntryPayload, ParsedChunk};
use crate::store::config::LogConfig;
use crate::store::format::{ChunkHeader, ChunkType, ParsedEntry};
use crate::store::recovery;
use crate::store::segment::SegmentAppender;
use crate::tools;
use crate::tracking::{self, TrackingState};

/// Identity of the most recently appended chunk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LastChunk {
    pub epoch: u64,
    pub chunk_id: u64,
    pub timestamp: i64,
    pub num_records: u32,
}

/// Writer cursor: the next chunk id to assign and the chunk before it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TailInfo {
    pub next_chunk_id: u64,
    pub last_chunk: Option<LastChunk>,
}

pub struct LogWriter {
    cfg: LogConfig,
    shared: Arc<SharedCells>,
    counters: Arc<CounterSet>,
    current: SegmentAppender,
    tail: TailInfo,
    tracking: TrackingState,
    retention: Option<Runner>,
}

impl LogWriter {
    /// Open (or create) the log directory for appending.
    ///
    /// Repairs the tail first, then refuses to open if the recovered
    /// epoch exceeds the configured one: a writer must never append at
    /// a lower epoch than what is already durable.
    pub fn init(cfg: LogConfig, shared: Arc<SharedCells>) -> Result<Self> {
        let recovered = recovery::repair_and_load(&cfg.dir, cfg.initial_offset)?;

        if let Some(last) = &recovered.tail.last_chunk {
            if last.epoch > cfg.epoch {
                return Err(StoreError::InvalidEpoch {
                    found: last.epoch,
                    configured: cfg.epoch,
                });
            }
        }

        let current = SegmentAppender::open(&cfg.dir, recovered.last_first_chunk_id)?;

        let extra_fields = cfg
            .counter_spec
            .as_ref()
            .map(|spec| spec.extra_fields.clone())
            .unwrap_or_default();
        let counters = counters::new(cfg.counter_name(), &extra_fields);

        shared.set_first_chunk_id(recovered.first_chunk_id.map(|v| v as i64).unwrap_or(-1));
        shared.set_last_chunk_id(
            recovered
                .tail
                .last_chunk
                .map(|c| c.chunk_id as i64)
                .unwrap_or(-1),
        );
        if let Some(first) = recovered.first_chunk_id {
            counters.put(FIRST_OFFSET, first as i64);
        }
        if let Some(ts) = recovered.first_timestamp {
            counters.put(FIRST_TIMESTAMP, ts);
        }
        if let Some(last) = &recovered.tail.last_chunk {
            counters.put(OFFSET, (last.chunk_id + last.num_records as u64) as i64 - 1);
        }
        counters.put(SEGMENTS, recovered.segment_count as i64);
        counters.put(CHUNKS, current.chunk_count as i64);

        let tracking = tracking::recover(&cfg.dir, cfg.tracking.clone())?;
        let retention = if cfg.retention.is_empty() {
            None
        } else {
            Some(Runner::spawn())
        };

        info!(
            "opened writer for log '{}' at epoch {}, next chunk id {}",
            cfg.name, cfg.epoch, recovered.tail.next_chunk_id
        );

        Ok(Self {
            cfg,
            shared,
            counters,
            current,
            tail: recovered.tail,
            tracking,
            retention,
        })
    }

    pub fn tail_info(&self) -> &TailInfo {
        &self.tail
    }

    pub fn shared(&self) -> &Arc<SharedCells> {
        &self.shared
    }

    pub fn counters(&self) -> &Arc<CounterSet> {
        &self.counters
    }

    pub fn tracking(&self) -> &TrackingState {
        &self.tracking
    }

    /// Assemble and append one chunk from local entries.
    pub fn write(
        &mut self,
        entries: &[EntryPayload],
        chunk_type: ChunkType,
        timestamp: i64,
        trailer: Option<&[u8]>,
    ) -> Result<()> {
        assert!(!entries.is_empty(), "chunks hold at least one entry");
        self.maybe_roll()?;
        let (header, bytes) = assemble(
            chunk_type,
            timestamp,
            self.cfg.epoch,
            self.tail.next_chunk_id,
            entries,
            trailer,
            self.cfg.filter_size,
        );
        self.append(&header, &bytes)
    }

    /// Append a pre-framed chunk from the replication stream unchanged.
    ///
    /// Only the segment pair rolls here; no chunk is ever synthesized.
    /// The leader interleaved its own tracking snapshot into the chunk
    /// stream, so it arrives like any other replicated chunk and the
    /// follower stays byte-identical.
    pub fn accept_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let parsed = ParsedChunk::parse(bytes)?;
        if parsed.header.chunk_id != self.tail.next_chunk_id {
            return Err(StoreError::AcceptOutOfOrder {
                seen: parsed.header.chunk_id,
                expected: self.tail.next_chunk_id,
            });
        }
        parsed.check_crc()?;
        let header = parsed.header;
        self.maybe_roll_segment()?;
        self.append(&header, bytes)
    }

    fn append(&mut self, header: &ChunkHeader, bytes: &[u8]) -> Result<()> {
        self.current.append_chunk(bytes, header)?;
        self.apply_tracking(header, bytes)?;

        self.tail = TailInfo {
            next_chunk_id: header.next_chunk_id(),
            last_chunk: Some(LastChunk {
                epoch: header.epoch,
                chunk_id: header.chunk_id,
                timestamp: header.timestamp,
                num_records: header.num_records,
            }),
        };

        if self.shared.first_chunk_id() < 0 {
            self.shared.set_first_chunk_id(header.chunk_id as i64);
            self.counters.put(FIRST_OFFSET, header.chunk_id as i64);
            self.counters.put(FIRST_TIMESTAMP, header.timestamp);
        }
        self.counters.add(CHUNKS, 1);
        self.counters
            .put(OFFSET, header.next_chunk_id() as i64 - 1);
        self.shared.set_last_chunk_id(header.chunk_id as i64);
        Ok(())
    }

    /// Keep the in-memory tracking state in step with what just went to
    /// disk, so rollover snapshots and dedup lookups see current data.
    fn apply_tracking(&mut self, header: &ChunkHeader, bytes: &[u8]) -> Result<()> {
        match header.chunk_type {
            ChunkType::User => {
                if header.trailer_size > 0 {
                    let trailer = &bytes[bytes.len() - header.trailer_size as usize..];
                    self.tracking.append_trailer(header.chunk_id, trailer)?;
                }
            }
            ChunkType::TrackingDelta | ChunkType::TrackingSnapshot => {
                let parsed = ParsedChunk::parse(bytes)?;
                for entry in parsed.entries() {
                    match entry? {
                        ParsedEntry::Record { data, .. } => {
                            if header.chunk_type == ChunkType::TrackingSnapshot {
                                self.tracking =
                                    TrackingState::init(Some(data), self.cfg.tracking.clone())?;
                            } else {
                                self.tracking.append_trailer(header.chunk_id, data)?;
                            }
                        }
                        ParsedEntry::SubBatch { .. } => {
                            return Err(StoreError::InvalidChunkHeader);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pre-append rollover check shared by both paths: open the next
    /// pair once the thresholds are met. A fresh segment always accepts
    /// at least one chunk. Returns whether a roll happened.
    fn maybe_roll_segment(&mut self) -> Result<bool> {
        if self.current.chunk_count == 0 {
            return Ok(false);
        }
        if self.current.size < self.cfg.max_segment_size_bytes
            && self.current.chunk_count < self.cfg.max_segment_size_chunks
        {
            return Ok(false);
        }

        info!(
            "log '{}': rolling to new segment at chunk id {}",
            self.cfg.name, self.tail.next_chunk_id
        );
        self.current = SegmentAppender::create(&self.cfg.dir, self.tail.next_chunk_id)?;
        self.counters.add(SEGMENTS, 1);
        self.schedule_retention();
        Ok(true)
    }

    /// Local-write rollover. After the segment rolls, non-empty
    /// tracking state is snapshotted into the head of the new segment
    /// so the recovery scan never has to look further back than one
    /// segment. Replication never takes this path: the leader's
    /// snapshot chunk travels in the stream.
    fn maybe_roll(&mut self) -> Result<()> {
        if !self.maybe_roll_segment()? {
            return Ok(());
        }

        if !self.tracking.is_empty() {
            let first_offset = self.shared.first_chunk_id().max(0) as u64;
            let first_timestamp = self.counters.get(FIRST_TIMESTAMP);
            let snapshot = self.tracking.snapshot(first_offset, first_timestamp);
            debug!(
                "log '{}': embedding tracking snapshot ({} bytes)",
                self.cfg.name,
                snapshot.len()
            );
            let (header, bytes) = assemble(
                ChunkType::TrackingSnapshot,
                tools::now_millis(),
                self.cfg.epoch,
                self.tail.next_chunk_id,
                &[EntryPayload::Simple(&snapshot)],
                None,
                self.cfg.filter_size,
            );
            self.append(&header, &bytes)?;
        }
        Ok(())
    }

    fn schedule_retention(&self) {
        let runner = match &self.retention {
            Some(runner) => runner,
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        let counters = Arc::clone(&self.counters);
        let name = self.cfg.name.clone();
        runner.eval(
            &self.cfg.name,
            &self.cfg.dir,
            &self.cfg.retention,
            Box::new(move |result| {
                if let Some((first, _last)) = result.range {
                    shared.set_first_chunk_id(first as i64);
                    counters.put(FIRST_OFFSET, first as i64);
                }
                if let Some(ts) = result.first_timestamp {
                    counters.put(FIRST_TIMESTAMP, ts);
                }
                counters.put(SEGMENTS, result.segments_left as i64);
                debug!(
                    "retention pass for '{}' left {} segments",
                    name, result.segments_left
                );
            }),
        );
    }
}
