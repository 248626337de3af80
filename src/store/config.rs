//! Writer and reader configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bloom::FilterSpec;
use crate::retention::RetentionSpec;
use crate::store::format::DEFAULT_FILTER_SIZE;
use crate::tracking::TrackingConfig;
use crate::transport::Transport;

pub const DEFAULT_MAX_SEGMENT_SIZE_BYTES: u64 = 500 * 1000 * 1000;
pub const DEFAULT_MAX_SEGMENT_SIZE_CHUNKS: u32 = 256_000;

/// Registration info for the process-global counters of a log.
#[derive(Clone, Debug)]
pub struct CounterSpec {
    pub name: String,
    pub extra_fields: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub name: String,
    /// Epoch the writer stamps into every chunk. Must be at or above
    /// the last epoch found on disk.
    pub epoch: u64,
    pub max_segment_size_bytes: u64,
    pub max_segment_size_chunks: u32,
    pub retention: Vec<RetentionSpec>,
    pub filter_size: u8,
    pub tracking: TrackingConfig,
    /// First chunk id when opening an acceptor against an empty log.
    pub initial_offset: Option<u64>,
    pub counter_spec: Option<CounterSpec>,
}

impl LogConfig {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, name: S) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            epoch: 0,
            max_segment_size_bytes: DEFAULT_MAX_SEGMENT_SIZE_BYTES,
            max_segment_size_chunks: DEFAULT_MAX_SEGMENT_SIZE_CHUNKS,
            retention: Vec::new(),
            filter_size: DEFAULT_FILTER_SIZE,
            tracking: TrackingConfig::default(),
            initial_offset: None,
            counter_spec: None,
        }
    }

    pub fn epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn max_segment_size_bytes(mut self, value: u64) -> Self {
        self.max_segment_size_bytes = value;
        self
    }

    pub fn max_segment_size_chunks(mut self, value: u32) -> Self {
        self.max_segment_size_chunks = value;
        self
    }

    pub fn retention(mut self, specs: Vec<RetentionSpec>) -> Self {
        self.retention = specs;
        self
    }

    pub fn filter_size(mut self, size: u8) -> Self {
        self.filter_size = size;
        self
    }

    pub fn initial_offset(mut self, offset: u64) -> Self {
        self.initial_offset = Some(offset);
        self
    }

    /// Counter registration name, defaulting to the log name.
    pub fn counter_name(&self) -> &str {
        self.counter_spec
            .as_ref()
            .map(|spec| spec.name.as_str())
            .unwrap_or(&self.name)
    }
}

/// Which chunk types an offset reader delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSelector {
    All,
    UserData,
}

impl Default for ChunkSelector {
    fn default() -> Self {
        ChunkSelector::UserData
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReaderOptions {
    pub chunk_selector: ChunkSelector,
    pub filter_spec: Option<FilterSpec>,
    pub transport: Transport,
}
