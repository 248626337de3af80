//! Chunk assembly and parsing.
//!
//! A chunk is the unit of write, replication and read:
//! `header ‖ filter ‖ data ‖ trailer`, with the CRC32 covering exactly
//! the data region. Assembly folds the caller's entries into the framed
//! data region and the Bloom accumulator in one pass.

use crc32fast::Hasher;

use crate::bloom::Filter;
use crate::error::{Result, StoreError};
use crate::store::format::{
    frame_simple, frame_sub_batch, ChunkHeader, ChunkType, EntryIter, CHUNK_HEADER_SIZE,
};

/// One entry handed to the writer.
pub enum EntryPayload<'a> {
    /// A plain record; contributes the empty string to the filter.
    Simple(&'a [u8]),
    /// A record with a filter value for read-side skipping.
    Filtered {
        filter_value: &'a [u8],
        data: &'a [u8],
    },
    /// A pre-framed compressed batch, passed through opaquely.
    SubBatch {
        compression: u8,
        num_records: u16,
        uncompressed_len: u32,
        data: &'a [u8],
    },
}

impl<'a> EntryPayload<'a> {
    fn num_records(&self) -> u32 {
        match self {
            EntryPayload::Simple(_) | EntryPayload::Filtered { .. } => 1,
            EntryPayload::SubBatch { num_records, .. } => *num_records as u32,
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Build the full on-disk byte run for a chunk.
pub fn assemble(
    chunk_type: ChunkType,
    timestamp: i64,
    epoch: u64,
    chunk_id: u64,
    entries: &[EntryPayload],
    trailer: Option<&[u8]>,
    filter_size: u8,
) -> (ChunkHeader, Vec<u8>) {
    assert!(!entries.is_empty(), "chunks hold at least one entry");

    let mut filter = Filter::new(filter_size);
    let mut data = Vec::new();
    let mut num_records: u32 = 0;

    for entry in entries {
        num_records += entry.num_records();
        match entry {
            EntryPayload::Simple(body) => {
                filter.insert(b"");
                frame_simple(&mut data, body);
            }
            EntryPayload::Filtered { filter_value, data: body } => {
                filter.insert(filter_value);
                frame_simple(&mut data, body);
            }
            EntryPayload::SubBatch {
                compression,
                num_records,
                uncompressed_len,
                data: body,
            } => {
                filter.insert(b"");
                frame_sub_batch(&mut data, *compression, *num_records, *uncompressed_len, body);
            }
        }
    }

    let filter_bytes = filter.to_bytes();
    let trailer = trailer.unwrap_or(&[]);

    let header = ChunkHeader {
        chunk_type,
        num_entries: entries.len() as u16,
        num_records,
        timestamp,
        epoch,
        chunk_id,
        crc: crc32(&data),
        data_size: data.len() as u32,
        trailer_size: trailer.len() as u32,
        filter_size: filter_bytes.len() as u8,
    };

    let mut bytes =
        Vec::with_capacity(CHUNK_HEADER_SIZE + filter_bytes.len() + data.len() + trailer.len());
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(filter_bytes);
    bytes.extend_from_slice(&data);
    bytes.extend_from_slice(trailer);

    (header, bytes)
}

/// Borrowed view of a raw chunk split into its regions.
pub struct ParsedChunk<'a> {
    pub header: ChunkHeader,
    pub filter: &'a [u8],
    pub data: &'a [u8],
    pub trailer: &'a [u8],
}

impl<'a> ParsedChunk<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = ChunkHeader::decode(bytes)?;
        if (bytes.len() as u64) < header.total_size() {
            return Err(StoreError::InvalidChunkHeader);
        }
        let filter_end = CHUNK_HEADER_SIZE + header.filter_size as usize;
        let data_end = filter_end + header.data_size as usize;
        let trailer_end = data_end + header.trailer_size as usize;
        Ok(Self {
            header,
            filter: &bytes[CHUNK_HEADER_SIZE..filter_end],
            data: &bytes[filter_end..data_end],
            trailer: &bytes[data_end..trailer_end],
        })
    }

    pub fn check_crc(&self) -> Result<()> {
        if crc32(self.data) != self.header.crc {
            return Err(StoreError::CrcMismatch {
                chunk_id: self.header.chunk_id,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> EntryIter<'a> {
        EntryIter::new(self.data, self.header.chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::format::ParsedEntry;

    #[test]
    fn assemble_then_parse() {
        let entries = [
            EntryPayload::Simple(b"first"),
            EntryPayload::Filtered {
                filter_value: b"route-a",
                data: b"second",
            },
            EntryPayload::SubBatch {
                compression: 2,
                num_records: 3,
                uncompressed_len: 64,
                data: b"compressed",
            },
        ];
        let (header, bytes) = assemble(ChunkType::User, 1000, 7, 20, &entries, Some(b"tr"), 16);

        assert_eq!(header.num_entries, 3);
        assert_eq!(header.num_records, 5);
        assert_eq!(header.chunk_id, 20);
        assert_eq!(header.next_chunk_id(), 25);
        assert_eq!(header.filter_size, 16);
        assert_eq!(header.trailer_size, 2);
        assert_eq!(bytes.len() as u64, header.total_size());

        let parsed = ParsedChunk::parse(&bytes).unwrap();
        parsed.check_crc().unwrap();
        assert_eq!(parsed.trailer, b"tr");

        let parsed_entries: Vec<_> = parsed.entries().collect::<Result<_>>().unwrap();
        assert_eq!(
            parsed_entries[0],
            ParsedEntry::Record {
                offset: 20,
                data: b"first"
            }
        );
        assert_eq!(
            parsed_entries[2],
            ParsedEntry::SubBatch {
                offset: 22,
                compression: 2,
                num_records: 3,
                uncompressed_len: 64,
                data: b"compressed"
            }
        );
    }

    #[test]
    fn crc_covers_only_data() {
        let (header, mut bytes) = assemble(
            ChunkType::User,
            0,
            1,
            0,
            &[EntryPayload::Simple(b"payload")],
            Some(b"trailer"),
            16,
        );

        // flip a trailer byte: crc still valid
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        ParsedChunk::parse(&bytes).unwrap().check_crc().unwrap();

        // flip a data byte: crc fails
        let data_start = CHUNK_HEADER_SIZE + header.filter_size as usize;
        bytes[data_start + 4] ^= 0xff;
        assert!(matches!(
            ParsedChunk::parse(&bytes).unwrap().check_crc(),
            Err(StoreError::CrcMismatch { chunk_id: 0 })
        ));
    }
}
