//! Reader tasks streaming chunks from the log.
//!
//! Two variants share one header-streaming engine. A data reader feeds
//! replication: it emits every chunk verbatim and is bounded by the
//! `last_chunk_id` cell. An offset reader feeds consumers: it is
//! bounded by `committed_chunk_id`, selects chunk types, and can skip
//! whole chunks via the Bloom filter without touching the data region.
//!
//! Each reader owns its file handle and cursor; there is no
//! coordination with the writer beyond the shared cells.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::bloom::{self, MatchResult, Matcher};
use crate::error::{Result, StoreError};
use crate::shared::SharedCells;
use crate::store::attach::{self, AttachPoint, AttachSpec};
use crate::store::chunk::ParsedChunk;
use crate::store::config::{ChunkSelector, ReaderOptions};
use crate::store::directory;
use crate::store::format::{
    ChunkHeader, ChunkType, ParsedEntry, CHUNK_HEADER_SIZE, DEFAULT_FILTER_SIZE, LOG_HEADER_SIZE,
};
use crate::tools;
use crate::transport::{Socket, Transport};

/// Invoked with +1 on reader open and -1 on close.
pub type ReadersCounterFun = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq)]
enum ReaderMode {
    Data,
    Offsets,
}

/// One record delivered by `read_chunk_parsed`.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadRecord {
    Record {
        offset: u64,
        data: Vec<u8>,
    },
    /// An opaque compressed batch; decompression is the consumer's job.
    SubBatch {
        offset: u64,
        compression: u8,
        num_records: u16,
        uncompressed_len: u32,
        data: Vec<u8>,
    },
}

pub struct LogReader {
    dir: PathBuf,
    name: String,
    mode: ReaderMode,
    selector: ChunkSelector,
    transport: Transport,
    shared: Arc<SharedCells>,
    matcher: Option<Matcher>,
    counter_fun: Option<ReadersCounterFun>,
    file: File,
    segment_first_chunk_id: u64,
    pos: u64,
    next_chunk_id: u64,
    closed: bool,
}

fn open_at(dir: &Path, spec: AttachSpec) -> Result<(AttachPoint, File)> {
    // the segment can vanish between resolution and open; retry once
    // against a fresh listing
    for _ in 0..2 {
        let target = attach::resolve_with_retry(dir, spec)?;
        let path = directory::segment_path(dir, target.segment_first_chunk_id);
        match tools::open_read(&path) {
            Ok(file) => return Ok((target, file)),
            Err(StoreError::MissingFile(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::RetriesExhausted)
}

impl LogReader {
    /// Open a consumer-facing reader bounded by the committed chunk id.
    pub fn init_offset_reader(
        dir: &Path,
        name: &str,
        spec: AttachSpec,
        shared: Arc<SharedCells>,
        options: ReaderOptions,
        counter_fun: Option<ReadersCounterFun>,
    ) -> Result<Self> {
        let (target, file) = open_at(dir, spec)?;
        let matcher = options
            .filter_spec
            .as_ref()
            .map(|spec| spec.matcher(DEFAULT_FILTER_SIZE));
        info!(
            "log '{}': offset reader attaching at chunk id {}",
            name, target.chunk_id
        );
        let reader = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            mode: ReaderMode::Offsets,
            selector: options.chunk_selector,
            transport: options.transport,
            shared,
            matcher,
            counter_fun,
            file,
            segment_first_chunk_id: target.segment_first_chunk_id,
            pos: target.file_pos,
            next_chunk_id: target.chunk_id,
            closed: false,
        };
        reader.count(1);
        Ok(reader)
    }

    /// Open a replication reader bounded by the last chunk id.
    ///
    /// `prev` is the leader's view of the chunk preceding the attach
    /// point; when it does not match the local log the follower has
    /// diverged and must reconcile before reading.
    pub fn init_data_reader(
        dir: &Path,
        name: &str,
        start_chunk_id: u64,
        prev: Option<(u64, u64)>,
        shared: Arc<SharedCells>,
        transport: Transport,
        counter_fun: Option<ReadersCounterFun>,
    ) -> Result<Self> {
        if let Some((epoch, chunk_id)) = prev {
            check_chunk_epoch(dir, epoch, chunk_id)?;
        }
        let (target, file) = open_at(dir, AttachSpec::Offset(start_chunk_id))?;
        info!(
            "log '{}': data reader attaching at chunk id {}",
            name, target.chunk_id
        );
        let reader = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            mode: ReaderMode::Data,
            selector: ChunkSelector::All,
            transport,
            shared,
            matcher: None,
            counter_fun,
            file,
            segment_first_chunk_id: target.segment_first_chunk_id,
            pos: target.file_pos,
            next_chunk_id: target.chunk_id,
            closed: false,
        };
        reader.count(1);
        Ok(reader)
    }

    pub fn next_chunk_id(&self) -> u64 {
        self.next_chunk_id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn count(&self, delta: i64) {
        if let Some(fun) = &self.counter_fun {
            fun(delta);
        }
    }

    /// The gate that makes reading safe: a header for chunk `k` may
    /// only be parsed once the writer published `k`.
    fn can_read_next(&self) -> bool {
        let bound = match self.mode {
            ReaderMode::Data => self.shared.last_chunk_id(),
            ReaderMode::Offsets => self.shared.committed_chunk_id(),
        };
        bound >= self.next_chunk_id as i64
    }

    fn skip(&mut self, header: &ChunkHeader) {
        self.pos += header.total_size();
        self.next_chunk_id = header.next_chunk_id();
    }

    /// Move to the segment covering the next readable chunk.
    ///
    /// Returns false when the current segment is still the right one,
    /// which means there is nothing more to read now.
    fn advance_segment(&mut self) -> Result<bool> {
        let first_cell = self.shared.first_chunk_id().max(0) as u64;
        let target = first_cell.max(self.next_chunk_id);
        let mut attempt = 0;
        loop {
            let found = match directory::find_segment_for(&self.dir, target)? {
                Some(found) => found,
                None => return Ok(false),
            };
            if found == self.segment_first_chunk_id {
                return Ok(false);
            }
            let path = directory::segment_path(&self.dir, found);
            match tools::open_read(&path) {
                Ok(file) => {
                    debug!(
                        "log '{}': reader moving to segment {:020}",
                        self.name, found
                    );
                    self.file = file;
                    self.segment_first_chunk_id = found;
                    self.pos = LOG_HEADER_SIZE;
                    if found > self.next_chunk_id {
                        // retention removed chunks under us
                        self.next_chunk_id = found;
                    }
                    return Ok(true);
                }
                Err(StoreError::MissingFile(_)) if attempt == 0 => {
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stream to the next deliverable chunk header.
    ///
    /// `Ok(None)` is end-of-stream: nothing more is readable right now.
    /// The cursor is left at the returned chunk; delivery helpers
    /// advance it.
    pub fn next_header(&mut self) -> Result<Option<ChunkHeader>> {
        loop {
            if !self.can_read_next() {
                return Ok(None);
            }

            let mut buf = [0u8; CHUNK_HEADER_SIZE + DEFAULT_FILTER_SIZE as usize];
            let got = tools::pread_some(&self.file, &mut buf, self.pos)?;
            if got < CHUNK_HEADER_SIZE {
                if self.advance_segment()? {
                    continue;
                }
                return Ok(None);
            }

            let header = ChunkHeader::decode(&buf[..CHUNK_HEADER_SIZE])?;
            if header.chunk_id != self.next_chunk_id {
                return Err(StoreError::UnexpectedChunkId {
                    found: header.chunk_id,
                    expected: self.next_chunk_id,
                });
            }

            if self.mode == ReaderMode::Offsets {
                if self.selector == ChunkSelector::UserData
                    && header.chunk_type != ChunkType::User
                {
                    self.skip(&header);
                    continue;
                }
                if self.matcher.is_some() {
                    let filter_size = header.filter_size as usize;
                    let filter;
                    let filter_buf;
                    if CHUNK_HEADER_SIZE + filter_size <= got {
                        filter = &buf[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + filter_size];
                    } else {
                        let mut owned = vec![0u8; filter_size];
                        tools::pread_exact(
                            &self.file,
                            &mut owned,
                            self.pos + CHUNK_HEADER_SIZE as u64,
                        )?;
                        filter_buf = owned;
                        filter = &filter_buf;
                    }
                    match bloom::is_match(filter, self.matcher.as_ref()) {
                        MatchResult::Match => {}
                        MatchResult::NoMatch => {
                            self.skip(&header);
                            continue;
                        }
                        MatchResult::Retry(matcher) => {
                            self.matcher = Some(matcher);
                            continue;
                        }
                    }
                }
            }

            return Ok(Some(header));
        }
    }

    /// Read the next chunk's full byte run, CRC-checked.
    pub fn read_chunk(&mut self) -> Result<Option<(ChunkHeader, Vec<u8>)>> {
        let header = match self.next_header()? {
            Some(header) => header,
            None => return Ok(None),
        };
        let mut bytes = vec![0u8; header.total_size() as usize];
        tools::pread_exact(&self.file, &mut bytes, self.pos)?;
        let parsed = ParsedChunk::parse(&bytes)?;
        parsed.check_crc()?;
        self.skip(&header);
        Ok(Some((header, bytes)))
    }

    /// Read the next chunk and split its data region into records.
    pub fn read_chunk_parsed(&mut self) -> Result<Option<(ChunkHeader, Vec<ReadRecord>)>> {
        let (header, bytes) = match self.read_chunk()? {
            Some(read) => read,
            None => return Ok(None),
        };
        let parsed = ParsedChunk::parse(&bytes)?;
        let mut records = Vec::with_capacity(header.num_entries as usize);
        for entry in parsed.entries() {
            records.push(match entry? {
                ParsedEntry::Record { offset, data } => ReadRecord::Record {
                    offset,
                    data: data.to_vec(),
                },
                ParsedEntry::SubBatch {
                    offset,
                    compression,
                    num_records,
                    uncompressed_len,
                    data,
                } => ReadRecord::SubBatch {
                    offset,
                    compression,
                    num_records,
                    uncompressed_len,
                    data: data.to_vec(),
                },
            });
        }
        Ok(Some((header, records)))
    }

    /// Send the next chunk into a socket: header bytes first, then the
    /// body straight from the segment file.
    ///
    /// An offset reader sends only the data region of the chunk; a data
    /// reader sends filter, data and trailer so the replica stores the
    /// chunk verbatim. On a socket error the cursor stays on the
    /// current chunk and a retry resumes there.
    pub fn send_file(&mut self, socket: &mut Socket) -> Result<Option<u64>> {
        let header = match self.next_header()? {
            Some(header) => header,
            None => return Ok(None),
        };

        let (body_offset, body_len) = match self.mode {
            ReaderMode::Offsets => (
                CHUNK_HEADER_SIZE as u64 + header.filter_size as u64,
                header.data_size as u64,
            ),
            ReaderMode::Data => (
                CHUNK_HEADER_SIZE as u64,
                header.total_size() - CHUNK_HEADER_SIZE as u64,
            ),
        };

        let mut head = [0u8; CHUNK_HEADER_SIZE];
        tools::pread_exact(&self.file, &mut head, self.pos)?;
        socket.send(&head)?;
        socket.sendfile(&self.file, self.pos + body_offset, body_len)?;

        self.skip(&header);
        Ok(Some(CHUNK_HEADER_SIZE as u64 + body_len))
    }

    pub fn close(mut self) {
        self.closed = true;
        self.count(-1);
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        if !self.closed {
            self.count(-1);
        }
    }
}

/// Verify that the local chunk `chunk_id` was written in `epoch`.
fn check_chunk_epoch(dir: &Path, epoch: u64, chunk_id: u64) -> Result<()> {
    let covering = match directory::find_segment_for(dir, chunk_id)? {
        Some(covering) => covering,
        None => {
            return Err(StoreError::InvalidLastOffsetEpoch {
                expected: (epoch, chunk_id),
                actual: None,
            })
        }
    };
    let index_path = directory::index_path(dir, covering);
    for record in directory::read_index_records(&index_path)? {
        if record.chunk_id == chunk_id {
            if record.epoch == epoch {
                return Ok(());
            }
            return Err(StoreError::InvalidLastOffsetEpoch {
                expected: (epoch, chunk_id),
                actual: Some((record.epoch, chunk_id)),
            });
        }
    }
    Err(StoreError::InvalidLastOffsetEpoch {
        expected: (epoch, chunk_id),
        actual: None,
    })
}
