//! Durable latest-position cache.
//!
//! This module provides the vehicle position store that:
//! - Keeps one row per identity key, overwritten by upsert and never deleted
//! - Refuses writes older than what is stored, so `last_seen` never regresses
//! - Splits large batches into independently committed chunks
//! - Serves point, region and key-fragment reads for lookups

mod layer;
mod storage;

pub use layer::{CacheStore, UpsertSummary, DEFAULT_MAX_BATCH};
pub use storage::{CacheStorage, ChunkOutcome, SqliteStorage};

#[cfg(test)]
pub(crate) use layer::tests::RecordingStorage;
