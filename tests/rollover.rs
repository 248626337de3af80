mod common;

use tempfile::TempDir;

use common::*;
use osilog::shared::SharedCells;
use osilog::store::attach::AttachSpec;
use osilog::store::directory;
use osilog::store::format::{ChunkType, TrackingEntry, TrackingType};
use osilog::store::{EntryPayload, LogConfig, LogWriter};
use osilog::tracking::{self, TrackingConfig};

// One chunk holding a single 45-byte entry occupies
// 56 (header) + 16 (filter) + 4 + 45 (framed entry) bytes.
const CHUNK_SIZE: u64 = 56 + 16 + 4 + 45;

#[test]
fn rollover_on_segment_size() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    // ten chunks fit below the limit, the eleventh write rolls
    let cfg = LogConfig::new(tmp.path(), "roll-log")
        .epoch(1)
        .max_segment_size_bytes(8 + 10 * CHUNK_SIZE - 1);
    let mut writer = LogWriter::init(cfg, std::sync::Arc::clone(&shared)).unwrap();

    let body = [7u8; 45];
    for i in 0..20 {
        write_simple(&mut writer, &[&body], 1000 + i);
    }

    let ids = directory::sorted_first_chunk_ids(tmp.path()).unwrap();
    assert_eq!(ids, vec![0, 10]);
    assert_eq!(writer.tail_info().next_chunk_id, 20);

    commit_all(&shared);
    let mut reader = open_reader(tmp.path(), AttachSpec::First, &shared);
    let records = collect_records(&mut reader);
    assert_eq!(records.len(), 20);
    assert_eq!(records[0].0, 0);
    assert_eq!(records[19].0, 19);
}

#[test]
fn rollover_on_chunk_count() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let cfg = LogConfig::new(tmp.path(), "roll-log")
        .epoch(1)
        .max_segment_size_chunks(3);
    let mut writer = LogWriter::init(cfg, std::sync::Arc::clone(&shared)).unwrap();

    for i in 0..7 {
        write_simple(&mut writer, &[b"x"], i);
    }

    let ids = directory::sorted_first_chunk_ids(tmp.path()).unwrap();
    assert_eq!(ids, vec![0, 3, 6]);
}

#[test]
fn rollover_embeds_tracking_snapshot() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let cfg = LogConfig::new(tmp.path(), "roll-log")
        .epoch(1)
        .max_segment_size_chunks(2);
    let mut writer = LogWriter::init(cfg, std::sync::Arc::clone(&shared)).unwrap();

    let mut trailer = Vec::new();
    TrackingEntry {
        kind: TrackingType::Sequence,
        id: b"producer-7".to_vec(),
        value: 41,
    }
    .encode_into(&mut trailer);

    writer
        .write(
            &[EntryPayload::Simple(b"one")],
            ChunkType::User,
            100,
            Some(&trailer),
        )
        .unwrap();
    write_simple(&mut writer, &[b"two"], 200);
    // third write rolls and prefixes the new segment with a snapshot
    write_simple(&mut writer, &[b"three"], 300);

    let ids = directory::sorted_first_chunk_ids(tmp.path()).unwrap();
    assert_eq!(ids, vec![0, 2]);
    let records = directory::read_index_records(&directory::index_path(tmp.path(), 2)).unwrap();
    assert_eq!(records[0].chunk_type, ChunkType::TrackingSnapshot);
    assert_eq!(records[0].chunk_id, 2);
    // the snapshot consumed one record offset
    assert_eq!(records[1].chunk_type, ChunkType::User);
    assert_eq!(records[1].chunk_id, 3);
    assert_eq!(writer.tail_info().next_chunk_id, 4);

    // a fresh scan of the newest segment reconstructs the state
    let state = tracking::recover(tmp.path(), TrackingConfig::default()).unwrap();
    assert_eq!(state.sequence(b"producer-7"), Some(41));
}
