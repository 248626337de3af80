#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use osilog::shared::SharedCells;
use osilog::store::format::ChunkType;
use osilog::store::{EntryPayload, LogConfig, LogReader, LogWriter, ReadRecord, ReaderOptions};
use osilog::store::attach::AttachSpec;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Log (and therefore counter) names derive from the temp dir so
/// parallel tests never share a counter set.
pub fn log_name(dir: &Path) -> String {
    let suffix = dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("test");
    format!("log-{}", suffix)
}

pub fn open_writer(dir: &Path, epoch: u64, shared: &Arc<SharedCells>) -> LogWriter {
    init_logging();
    let cfg = LogConfig::new(dir, log_name(dir)).epoch(epoch);
    LogWriter::init(cfg, Arc::clone(shared)).expect("writer init")
}

pub fn write_simple(writer: &mut LogWriter, bodies: &[&[u8]], timestamp: i64) {
    let entries: Vec<EntryPayload> = bodies.iter().map(|b| EntryPayload::Simple(b)).collect();
    writer
        .write(&entries, ChunkType::User, timestamp, None)
        .expect("write");
}

/// Mark everything written so far as committed, so offset readers see it.
pub fn commit_all(shared: &Arc<SharedCells>) {
    shared.set_committed_chunk_id(shared.last_chunk_id());
}

pub fn open_reader(dir: &Path, spec: AttachSpec, shared: &Arc<SharedCells>) -> LogReader {
    LogReader::init_offset_reader(
        dir,
        &log_name(dir),
        spec,
        Arc::clone(shared),
        ReaderOptions::default(),
        None,
    )
    .expect("reader init")
}

/// Drain the reader, returning `(offset, body)` for every simple record.
pub fn collect_records(reader: &mut LogReader) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    while let Some((_header, records)) = reader.read_chunk_parsed().expect("read") {
        for record in records {
            match record {
                ReadRecord::Record { offset, data } => out.push((offset, data)),
                ReadRecord::SubBatch { .. } => panic!("unexpected sub-batch"),
            }
        }
    }
    out
}
