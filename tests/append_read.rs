mod common;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::sync::Arc;

use tempfile::TempDir;

use common::*;
use osilog::bloom::FilterSpec;
use osilog::counters;
use osilog::shared::SharedCells;
use osilog::store::attach::{self, AttachSpec};
use osilog::store::format::{ChunkHeader, ChunkType, CHUNK_HEADER_SIZE};
use osilog::store::{EntryPayload, LogReader, ReadRecord, ReaderOptions};
use osilog::transport::Socket;
use osilog::StoreError;

#[test]
fn append_and_read_back() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);

    write_simple(&mut writer, &[b"a"], 1000);
    write_simple(&mut writer, &[b"bb", b"ccc"], 2000);
    write_simple(&mut writer, &[b"d"], 3000);

    assert_eq!(writer.tail_info().next_chunk_id, 4);
    assert_eq!(shared.first_chunk_id(), 0);
    assert_eq!(shared.last_chunk_id(), 3);
    assert_eq!(writer.counters().get(counters::FIRST_OFFSET), 0);
    assert_eq!(writer.counters().get(counters::OFFSET), 3);
    assert_eq!(writer.counters().get(counters::CHUNKS), 3);

    commit_all(&shared);
    let mut reader = open_reader(tmp.path(), AttachSpec::First, &shared);
    let records = collect_records(&mut reader);
    assert_eq!(
        records,
        vec![
            (0, b"a".to_vec()),
            (1, b"bb".to_vec()),
            (2, b"ccc".to_vec()),
            (3, b"d".to_vec()),
        ]
    );
    // nothing more is readable now
    assert!(reader.read_chunk().unwrap().is_none());
}

#[test]
fn sub_batches_pass_through_opaquely() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);

    let entries = [
        EntryPayload::Simple(b"plain"),
        EntryPayload::SubBatch {
            compression: 1,
            num_records: 3,
            uncompressed_len: 200,
            data: b"opaque-zstd-bytes",
        },
    ];
    writer.write(&entries, ChunkType::User, 500, None).unwrap();
    commit_all(&shared);

    let mut reader = open_reader(tmp.path(), AttachSpec::First, &shared);
    let (_, records) = reader.read_chunk_parsed().unwrap().unwrap();
    assert_eq!(
        records,
        vec![
            ReadRecord::Record {
                offset: 0,
                data: b"plain".to_vec()
            },
            ReadRecord::SubBatch {
                offset: 1,
                compression: 1,
                num_records: 3,
                uncompressed_len: 200,
                data: b"opaque-zstd-bytes".to_vec()
            },
        ]
    );
    assert_eq!(writer.tail_info().next_chunk_id, 4);
}

#[test]
fn crc_failure_on_corrupted_data() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);
    write_simple(&mut writer, &[b"a"], 1000);
    write_simple(&mut writer, &[b"b"], 2000);
    commit_all(&shared);
    drop(writer);

    // flip a data byte of the second chunk (header 56 + filter 16 +
    // 4-byte entry length prefix into its body)
    let chunk0_size = 56 + 16 + 4 + 1;
    let second_chunk_pos = 8 + chunk0_size;
    let segment_path = tmp.path().join("00000000000000000000.segment");
    let mut segment = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment_path)
        .unwrap();
    segment
        .seek(SeekFrom::Start(second_chunk_pos + 56 + 16 + 4))
        .unwrap();
    segment.write_all(&[0xff]).unwrap();
    drop(segment);

    let mut reader = open_reader(tmp.path(), AttachSpec::First, &shared);
    assert!(reader.read_chunk().unwrap().is_some());
    match reader.read_chunk() {
        Err(StoreError::CrcMismatch { chunk_id: 1 }) => {}
        other => panic!("expected crc mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn abs_offset_out_of_range() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);
    write_simple(&mut writer, &[b"a", b"b"], 1000);

    match attach::resolve(tmp.path(), AttachSpec::Abs(99)) {
        Err(StoreError::OffsetOutOfRange {
            offset: 99,
            range: (0, 2),
        }) => {}
        other => panic!("expected out of range, got {:?}", other),
    }
    // last + 1 is valid and resolves to the append position
    let point = attach::resolve(tmp.path(), AttachSpec::Abs(2)).unwrap();
    assert_eq!(point.chunk_id, 2);
}

#[test]
fn bloom_filter_skips_chunks() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);

    writer
        .write(
            &[EntryPayload::Filtered {
                filter_value: b"apple",
                data: b"apple-record",
            }],
            ChunkType::User,
            1000,
            None,
        )
        .unwrap();
    writer
        .write(
            &[EntryPayload::Filtered {
                filter_value: b"banana",
                data: b"banana-record",
            }],
            ChunkType::User,
            2000,
            None,
        )
        .unwrap();
    commit_all(&shared);

    let options = ReaderOptions {
        filter_spec: Some(FilterSpec {
            values: vec!["banana".to_string()],
            match_unfiltered: false,
        }),
        ..Default::default()
    };
    let mut reader = LogReader::init_offset_reader(
        tmp.path(),
        "test-log",
        AttachSpec::First,
        Arc::clone(&shared),
        options,
        None,
    )
    .unwrap();

    let records = collect_records(&mut reader);
    assert_eq!(records, vec![(1, b"banana-record".to_vec())]);
}

#[test]
fn send_file_streams_data_region_over_tcp() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);
    write_simple(&mut writer, &[b"hello"], 1000);
    commit_all(&shared);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut bytes = Vec::new();
        conn.read_to_end(&mut bytes).unwrap();
        bytes
    });

    let stream = std::net::TcpStream::connect(addr).unwrap();
    let mut socket = Socket::Tcp(stream);

    let mut reader = open_reader(tmp.path(), AttachSpec::First, &shared);
    let sent = reader.send_file(&mut socket).unwrap().unwrap();
    assert!(reader.send_file(&mut socket).unwrap().is_none());
    drop(socket);

    let bytes = receiver.join().unwrap();
    assert_eq!(bytes.len() as u64, sent);

    // header followed by the bare data region (no filter, no trailer)
    let header = ChunkHeader::decode(&bytes[..CHUNK_HEADER_SIZE]).unwrap();
    assert_eq!(header.chunk_id, 0);
    assert_eq!(bytes.len(), CHUNK_HEADER_SIZE + header.data_size as usize);
    assert_eq!(&bytes[CHUNK_HEADER_SIZE + 4..], &b"hello"[..]);
}

#[test]
fn readers_counter_fun_tracks_open_readers() {
    let tmp = TempDir::new().unwrap();
    let shared = SharedCells::new();
    let mut writer = open_writer(tmp.path(), 1, &shared);
    write_simple(&mut writer, &[b"a"], 1000);
    commit_all(&shared);

    let open_count = Arc::new(std::sync::atomic::AtomicI64::new(0));
    let counted = Arc::clone(&open_count);
    let fun: osilog::store::ReadersCounterFun = Arc::new(move |delta| {
        counted.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    });

    let reader = LogReader::init_offset_reader(
        tmp.path(),
        "test-log",
        AttachSpec::First,
        Arc::clone(&shared),
        ReaderOptions::default(),
        Some(fun),
    )
    .unwrap();
    assert_eq!(open_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    reader.close();
    assert_eq!(open_count.load(std::sync::atomic::Ordering::SeqCst), 0);
}
