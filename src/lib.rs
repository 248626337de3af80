//! An append-only, segmented, chunk-oriented log.
//!
//! This crate is the storage substrate for a replicated streaming
//! message system: producers append record batches ("chunks") at the
//! head, replicas mirror the chunk stream, and many concurrent readers
//! stream bytes to sockets from any position. The log is the single
//! source of truth for ordering, epoch-based reconciliation, consumer
//! offsets and producer dedup sequences, and retention.
//!
//! See [`store`] for the storage engine itself.

pub mod bloom;
pub mod counters;
pub mod error;
pub mod retention;
pub mod shared;
pub mod store;
pub mod tools;
pub mod tracking;
pub mod transport;

pub use error::{Result, StoreError};
pub use shared::SharedCells;
