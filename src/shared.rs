//! Shared chunk-id cells crossing the writer/reader task boundary.
//!
//! The writer publishes `last_chunk_id` after every append; the
//! replication layer publishes `committed_chunk_id` once a quorum
//! acknowledged; retention moves `first_chunk_id` forward. Readers gate
//! on these cells before parsing a header, which is the only
//! writer-reader synchronization point in the engine.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// All cells start at -1, meaning "empty log".
#[derive(Debug)]
pub struct SharedCells {
    first_chunk_id: AtomicI64,
    last_chunk_id: AtomicI64,
    committed_chunk_id: AtomicI64,
}

impl SharedCells {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            first_chunk_id: AtomicI64::new(-1),
            last_chunk_id: AtomicI64::new(-1),
            committed_chunk_id: AtomicI64::new(-1),
        })
    }

    pub fn set_first_chunk_id(&self, value: i64) {
        self.first_chunk_id.store(value, Ordering::Release);
    }

    pub fn first_chunk_id(&self) -> i64 {
        self.first_chunk_id.load(Ordering::Acquire)
    }

    pub fn set_last_chunk_id(&self, value: i64) {
        self.last_chunk_id.store(value, Ordering::Release);
    }

    pub fn last_chunk_id(&self) -> i64 {
        self.last_chunk_id.load(Ordering::Acquire)
    }

    pub fn set_committed_chunk_id(&self, value: i64) {
        self.committed_chunk_id.store(value, Ordering::Release);
    }

    pub fn committed_chunk_id(&self) -> i64 {
        self.committed_chunk_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_start_empty() {
        let cells = SharedCells::new();
        assert_eq!(cells.first_chunk_id(), -1);
        assert_eq!(cells.last_chunk_id(), -1);
        assert_eq!(cells.committed_chunk_id(), -1);
        cells.set_last_chunk_id(7);
        assert_eq!(cells.last_chunk_id(), 7);
    }
}
