//! Cache store that chunks batched writes and keeps storage calls off the async workers.

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use super::storage::{CacheStorage, ChunkOutcome};
use crate::error::StoreError;
use crate::types::{CacheEntry, Region};

/// Rows per upsert request unless configured otherwise.
pub const DEFAULT_MAX_BATCH: usize = 500;

/// Summary of one `upsert_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSummary {
  pub written: usize,
  pub stale: usize,
  /// Chunks that failed; their rows are lost until the next cycle
  pub failed_chunks: usize,
  pub failed_rows: usize,
}

impl UpsertSummary {
  fn absorb(&mut self, outcome: ChunkOutcome) {
    self.written += outcome.written;
    self.stale += outcome.stale;
  }
}

/// Shared key to latest-position mapping.
///
/// Sources only propose writes through [`CacheStore::upsert_batch`]; readers
/// use the lookup methods. Cloning is cheap and shares the backend.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
  max_batch: usize,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      max_batch: DEFAULT_MAX_BATCH,
    }
  }

  /// Set the per-request row ceiling. Zero is treated as one.
  pub fn with_max_batch(mut self, max_batch: usize) -> Self {
    self.max_batch = max_batch.max(1);
    self
  }

  /// Upsert a batch, split into chunks of at most `max_batch` rows.
  ///
  /// A failing chunk is logged and skipped; sibling chunks still run and no
  /// transaction spans chunks.
  pub async fn upsert_batch(&self, entries: Vec<CacheEntry>) -> UpsertSummary {
    let mut summary = UpsertSummary::default();

    for chunk in entries.chunks(self.max_batch) {
      let rows = chunk.len();
      let chunk = chunk.to_vec();
      let storage = Arc::clone(&self.storage);

      let result = tokio::task::spawn_blocking(move || storage.upsert_chunk(&chunk))
        .await
        .map_err(StoreError::from)
        .and_then(|r| r);

      match result {
        Ok(outcome) => summary.absorb(outcome),
        Err(e) => {
          warn!(rows, error = %e, "cache chunk upsert failed");
          summary.failed_chunks += 1;
          summary.failed_rows += rows;
        }
      }
    }

    summary
  }

  pub async fn get_by_key(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let storage = Arc::clone(&self.storage);
    let key = identity_key.to_string();
    tokio::task::spawn_blocking(move || storage.get(&key)).await?
  }

  pub async fn get_by_region(&self, region: Region) -> Result<Vec<CacheEntry>, StoreError> {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || storage.select_region(region)).await?
  }

  pub async fn search_by_key_fragment(
    &self,
    region: Region,
    fragment: &str,
  ) -> Result<Vec<CacheEntry>, StoreError> {
    let storage = Arc::clone(&self.storage);
    let fragment = fragment.to_string();
    tokio::task::spawn_blocking(move || storage.select_fragment(region, &fragment)).await?
  }
}

impl<S: CacheStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      max_batch: self.max_batch,
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use chrono::{DateTime, Utc};
  use std::sync::Mutex;

  fn entry(key: &str) -> CacheEntry {
    CacheEntry {
      identity_key: key.to_string(),
      region: Region::Nsw,
      latitude: -33.87,
      longitude: 151.21,
      last_seen: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
    }
  }

  /// Records chunk sizes and fails any chunk or read touching the poisoned key.
  pub(crate) struct RecordingStorage {
    chunks: Mutex<Vec<usize>>,
    poison: &'static str,
  }

  impl RecordingStorage {
    pub(crate) fn new(poison: &'static str) -> Self {
      Self {
        chunks: Mutex::new(Vec::new()),
        poison,
      }
    }
  }

  impl CacheStorage for RecordingStorage {
    fn upsert_chunk(&self, entries: &[CacheEntry]) -> Result<ChunkOutcome, StoreError> {
      self.chunks.lock().unwrap().push(entries.len());
      if entries.iter().any(|e| e.identity_key == self.poison) {
        return Err(StoreError::LockPoisoned);
      }
      Ok(ChunkOutcome {
        written: entries.len(),
        stale: 0,
      })
    }

    fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError> {
      if identity_key == self.poison {
        return Err(StoreError::LockPoisoned);
      }
      Ok(None)
    }

    fn select_region(&self, _region: Region) -> Result<Vec<CacheEntry>, StoreError> {
      Ok(Vec::new())
    }

    fn select_fragment(
      &self,
      _region: Region,
      _fragment: &str,
    ) -> Result<Vec<CacheEntry>, StoreError> {
      Ok(Vec::new())
    }
  }

  #[tokio::test]
  async fn test_batch_is_chunked_at_ceiling() {
    let store = CacheStore::new(RecordingStorage::new(""));
    let entries: Vec<_> = (0..1201).map(|i| entry(&format!("K{}", i))).collect();

    let summary = store.upsert_batch(entries).await;

    assert_eq!(summary.written, 1201);
    assert_eq!(*store.storage.chunks.lock().unwrap(), vec![500, 500, 201]);
  }

  #[tokio::test]
  async fn test_failed_chunk_does_not_abort_siblings() {
    let store = CacheStore::new(RecordingStorage::new("K3")).with_max_batch(2);
    let entries: Vec<_> = (0..6).map(|i| entry(&format!("K{}", i))).collect();

    let summary = store.upsert_batch(entries).await;

    assert_eq!(summary.failed_chunks, 1);
    assert_eq!(summary.failed_rows, 2);
    assert_eq!(summary.written, 4);
    assert_eq!(store.storage.chunks.lock().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_reads_through_sqlite() {
    let store = CacheStore::new(SqliteStorage::in_memory().unwrap());
    store
      .upsert_batch(vec![entry("AB1234"), entry("CD1234X")])
      .await;

    assert!(store.get_by_key("AB1234").await.unwrap().is_some());
    assert_eq!(store.get_by_region(Region::Nsw).await.unwrap().len(), 2);
    assert_eq!(
      store
        .search_by_key_fragment(Region::Nsw, "1234")
        .await
        .unwrap()
        .len(),
      2
    );
    assert!(store
      .search_by_key_fragment(Region::Vic, "1234")
      .await
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_empty_batch_is_a_noop() {
    let store = CacheStore::new(SqliteStorage::in_memory().unwrap());
    assert_eq!(store.upsert_batch(Vec::new()).await, UpsertSummary::default());
  }
}
