//! Cache storage trait and SQLite implementation.

use chrono::DateTime;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::types::{CacheEntry, Region};

/// Outcome of writing one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
  /// Rows inserted or overwritten
  pub written: usize,
  /// Rows ignored because the stored position is newer
  pub stale: usize,
}

/// Trait for cache storage backends.
///
/// Every method is blocking; `CacheStore` moves calls onto the blocking pool.
pub trait CacheStorage: Send + Sync + 'static {
  /// Upsert one chunk. Each row is resolved independently by identity key and
  /// never moves a key's `last_seen` backwards.
  fn upsert_chunk(&self, entries: &[CacheEntry]) -> Result<ChunkOutcome, StoreError>;

  /// Get a single entry by identity key.
  fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError>;

  /// All entries in a region, ordered by key.
  fn select_region(&self, region: Region) -> Result<Vec<CacheEntry>, StoreError>;

  /// Entries in a region whose key contains `fragment`, ordered by key.
  fn select_fragment(&self, region: Region, fragment: &str) -> Result<Vec<CacheEntry>, StoreError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
      })?;
    }

    let conn = Connection::open(&path).map_err(|e| StoreError::Open {
      path: path.display().to_string(),
      reason: e.to_string(),
    })?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, used by tests and `store.path: ":memory:"`.
  pub fn in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Open {
        path: "<data dir>".to_string(),
        reason: "could not determine data directory".to_string(),
      })?;

    Ok(data_dir.join("fleetwatch").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
-- One row per vehicle identity; last_seen is unix milliseconds
CREATE TABLE IF NOT EXISTS vehicle_cache (
    identity_key TEXT PRIMARY KEY,
    region TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vehicle_cache_region ON vehicle_cache(region);
"#;

const UPSERT: &str = "INSERT INTO vehicle_cache (identity_key, region, latitude, longitude, last_seen)
   VALUES (?1, ?2, ?3, ?4, ?5)
   ON CONFLICT(identity_key) DO UPDATE SET
     region = excluded.region,
     latitude = excluded.latitude,
     longitude = excluded.longitude,
     last_seen = excluded.last_seen
   WHERE excluded.last_seen >= vehicle_cache.last_seen";

const SELECT_COLUMNS: &str =
  "SELECT identity_key, region, latitude, longitude, last_seen FROM vehicle_cache";

impl CacheStorage for SqliteStorage {
  fn upsert_chunk(&self, entries: &[CacheEntry]) -> Result<ChunkOutcome, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let mut outcome = ChunkOutcome::default();

    {
      let mut stmt = tx.prepare_cached(UPSERT)?;
      for entry in entries {
        let changed = stmt.execute(params![
          entry.identity_key,
          entry.region.as_str(),
          entry.latitude,
          entry.longitude,
          entry.last_seen.timestamp_millis(),
        ])?;
        if changed > 0 {
          outcome.written += 1;
        } else {
          outcome.stale += 1;
        }
      }
    }

    tx.commit()?;
    Ok(outcome)
  }

  fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(&format!("{} WHERE identity_key = ?1", SELECT_COLUMNS))?;
    let mut rows = stmt.query(params![identity_key])?;

    match rows.next()? {
      Some(row) => Ok(Some(entry_from_row(row)?)),
      None => Ok(None),
    }
  }

  fn select_region(&self, region: Region) -> Result<Vec<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(&format!(
      "{} WHERE region = ?1 ORDER BY identity_key",
      SELECT_COLUMNS
    ))?;
    let mut rows = stmt.query(params![region.as_str()])?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
      entries.push(entry_from_row(row)?);
    }
    Ok(entries)
  }

  fn select_fragment(&self, region: Region, fragment: &str) -> Result<Vec<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    // instr() rather than LIKE so '%' and '_' in the fragment match literally
    let mut stmt = conn.prepare_cached(&format!(
      "{} WHERE region = ?1 AND instr(identity_key, ?2) > 0 ORDER BY identity_key",
      SELECT_COLUMNS
    ))?;
    let mut rows = stmt.query(params![region.as_str(), fragment])?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
      entries.push(entry_from_row(row)?);
    }
    Ok(entries)
  }
}

fn entry_from_row(row: &Row<'_>) -> Result<CacheEntry, StoreError> {
  let identity_key: String = row.get(0)?;
  let region: String = row.get(1)?;
  let last_seen_ms: i64 = row.get(4)?;

  let region = region.parse::<Region>().map_err(|reason| StoreError::Corrupt {
    key: identity_key.clone(),
    reason,
  })?;
  let last_seen = DateTime::from_timestamp_millis(last_seen_ms).ok_or_else(|| StoreError::Corrupt {
    key: identity_key.clone(),
    reason: format!("timestamp {} out of range", last_seen_ms),
  })?;

  Ok(CacheEntry {
    identity_key,
    region,
    latitude: row.get(2)?,
    longitude: row.get(3)?,
    last_seen,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};

  fn entry(key: &str, region: Region, lat: f64, age_secs: i64) -> CacheEntry {
    CacheEntry {
      identity_key: key.to_string(),
      region,
      latitude: lat,
      longitude: 151.2,
      last_seen: DateTime::from_timestamp_millis(
        (Utc::now() - Duration::seconds(age_secs)).timestamp_millis(),
      )
      .unwrap(),
    }
  }

  #[test]
  fn test_upsert_and_get() {
    let storage = SqliteStorage::in_memory().unwrap();
    let e = entry("AB1234", Region::Nsw, -33.8, 5);

    let outcome = storage.upsert_chunk(&[e.clone()]).unwrap();
    assert_eq!(outcome.written, 1);
    assert_eq!(storage.get("AB1234").unwrap(), Some(e));
    assert_eq!(storage.get("ZZ9999").unwrap(), None);
  }

  #[test]
  fn test_newer_write_replaces_whole_record() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
      .upsert_chunk(&[entry("AB1234", Region::Nsw, -33.8, 60)])
      .unwrap();

    let newer = entry("AB1234", Region::Vic, -37.8, 1);
    storage.upsert_chunk(&[newer.clone()]).unwrap();

    assert_eq!(storage.get("AB1234").unwrap(), Some(newer));
  }

  #[test]
  fn test_older_write_does_not_regress() {
    let storage = SqliteStorage::in_memory().unwrap();
    let fresh = entry("AB1234", Region::Nsw, -33.8, 1);
    storage.upsert_chunk(&[fresh.clone()]).unwrap();

    let outcome = storage
      .upsert_chunk(&[entry("AB1234", Region::Nsw, -34.0, 90)])
      .unwrap();

    assert_eq!(outcome, ChunkOutcome { written: 0, stale: 1 });
    assert_eq!(storage.get("AB1234").unwrap(), Some(fresh));
  }

  #[test]
  fn test_select_region_and_fragment() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
      .upsert_chunk(&[
        entry("AB1234", Region::Nsw, -33.8, 1),
        entry("CD1235", Region::Nsw, -33.9, 1),
        entry("EF1234", Region::Vic, -37.8, 1),
      ])
      .unwrap();

    let nsw = storage.select_region(Region::Nsw).unwrap();
    let keys: Vec<_> = nsw.iter().map(|e| e.identity_key.as_str()).collect();
    assert_eq!(keys, vec!["AB1234", "CD1235"]);

    let matches = storage.select_fragment(Region::Nsw, "1234").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].identity_key, "AB1234");

    assert!(storage.select_fragment(Region::Nsw, "%").unwrap().is_empty());
  }

  #[test]
  fn test_open_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    storage
      .upsert_chunk(&[entry("AB1234", Region::Nsw, -33.8, 1)])
      .unwrap();
    drop(storage);

    let reopened = SqliteStorage::open(Some(&path)).unwrap();
    assert!(reopened.get("AB1234").unwrap().is_some());
  }
}
