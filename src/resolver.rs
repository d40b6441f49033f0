//! Read-only lookups over the fleet reference table and the position cache.
//!
//! Nothing here fetches from providers; freshness is whatever the last
//! completed poll or push left behind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheStorage, CacheStore};
use crate::error::StoreError;
use crate::fleet::FleetReference;
use crate::freshness::{classify, Liveness};
use crate::identity::{normalize, Scheme};
use crate::types::{CacheEntry, Region};

/// Registration fragments are exactly this many ASCII digits.
pub const FRAGMENT_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
  pub status: Liveness,
  pub rego: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fleet: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub operator: Option<String>,
  pub region: Region,
  pub lat: f64,
  pub lon: f64,
  pub last_seen: DateTime<Utc>,
  pub age_ms: i64,
}

/// Lookup outcomes other than a single hit.
///
/// Everything but `Store` is an expected answer, not a fault.
#[derive(Debug, Error)]
pub enum LookupError {
  #[error("fleet_not_found")]
  FleetNotFound,

  #[error("bus_not_active")]
  BusNotActive { searching_for: String },

  #[error("not_found")]
  NotFound,

  #[error("{} vehicles match", matches.len())]
  Ambiguous { matches: Vec<String> },

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub struct LookupResolver<S: CacheStorage> {
  fleet: Arc<FleetReference>,
  cache: CacheStore<S>,
  threshold_ms: i64,
  /// Identifier scheme of each region's poller; registration when unset
  schemes: HashMap<Region, Scheme>,
}

impl<S: CacheStorage> LookupResolver<S> {
  pub fn new(fleet: Arc<FleetReference>, cache: CacheStore<S>, threshold_ms: i64) -> Self {
    Self {
      fleet,
      cache,
      threshold_ms,
      schemes: HashMap::new(),
    }
  }

  /// Normalize exact lookups in `region` the way its feed keys were
  /// normalized. The first scheme set for a region sticks.
  pub fn with_scheme(mut self, region: Region, scheme: Scheme) -> Self {
    self.schemes.entry(region).or_insert(scheme);
    self
  }

  fn scheme(&self, region: Region) -> Scheme {
    self.schemes.get(&region).copied().unwrap_or_default()
  }

  /// Operators known for a fleet number.
  pub fn operators(&self, fleet: &str) -> Result<Vec<String>, LookupError> {
    let operators = self.fleet.operators(fleet);
    if operators.is_empty() {
      return Err(LookupError::FleetNotFound);
    }
    Ok(operators.into_iter().map(String::from).collect())
  }

  /// Position of the bus with a given fleet number and operator.
  pub async fn by_fleet(
    &self,
    fleet: &str,
    operator: &str,
    now: DateTime<Utc>,
  ) -> Result<VehicleStatus, LookupError> {
    let record = self
      .fleet
      .lookup(fleet, operator)
      .ok_or(LookupError::FleetNotFound)?;

    let key = normalize(&record.registration, Scheme::Registration);
    let not_active = || LookupError::BusNotActive {
      searching_for: key.clone(),
    };
    if key.is_empty() {
      return Err(not_active());
    }

    let entry = self.cache.get_by_key(&key).await?.ok_or_else(not_active)?;

    let mut status = self.status(entry, now);
    status.fleet = Some(record.fleet.clone());
    status.operator = Some(record.operator.clone());
    Ok(status)
  }

  /// Lookup by a registration fragment where no fleet reference exists.
  ///
  /// More than one hit yields the candidate keys only; callers follow up with
  /// [`LookupResolver::by_exact`].
  pub async fn by_fragment(
    &self,
    region: Region,
    fragment: &str,
    now: DateTime<Utc>,
  ) -> Result<VehicleStatus, LookupError> {
    if !is_valid_fragment(fragment) {
      return Err(LookupError::NotFound);
    }

    let mut matches = self.cache.search_by_key_fragment(region, fragment).await?;
    match matches.len() {
      0 => Err(LookupError::NotFound),
      1 => Ok(self.status(matches.remove(0), now)),
      _ => Err(LookupError::Ambiguous {
        matches: matches.into_iter().map(|e| e.identity_key).collect(),
      }),
    }
  }

  /// Lookup by full identifier within a region.
  pub async fn by_exact(
    &self,
    region: Region,
    registration: &str,
    now: DateTime<Utc>,
  ) -> Result<VehicleStatus, LookupError> {
    let key = normalize(registration, self.scheme(region));
    if key.is_empty() {
      return Err(LookupError::NotFound);
    }

    match self.cache.get_by_key(&key).await? {
      Some(entry) if entry.region == region => Ok(self.status(entry, now)),
      _ => Err(LookupError::NotFound),
    }
  }

  /// Every cached vehicle in a region with its liveness.
  pub async fn region_vehicles(
    &self,
    region: Region,
    now: DateTime<Utc>,
  ) -> Result<Vec<VehicleStatus>, LookupError> {
    let entries = self.cache.get_by_region(region).await?;
    Ok(entries.into_iter().map(|e| self.status(e, now)).collect())
  }

  fn status(&self, entry: CacheEntry, now: DateTime<Utc>) -> VehicleStatus {
    let verdict = classify(entry.last_seen, now, self.threshold_ms);
    VehicleStatus {
      status: verdict.status,
      rego: entry.identity_key,
      fleet: None,
      operator: None,
      region: entry.region,
      lat: entry.latitude,
      lon: entry.longitude,
      last_seen: entry.last_seen,
      age_ms: verdict.age_millis,
    }
  }
}

fn is_valid_fragment(fragment: &str) -> bool {
  fragment.len() == FRAGMENT_LEN && fragment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::fleet::FleetRecord;
  use crate::freshness::DEFAULT_THRESHOLD_MS;
  use chrono::Duration;

  fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
  }

  fn entry(key: &str, region: Region, last_seen: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      identity_key: key.to_string(),
      region,
      latitude: -37.81,
      longitude: 144.96,
      last_seen,
    }
  }

  async fn resolver(entries: Vec<CacheEntry>) -> LookupResolver<SqliteStorage> {
    let fleet = FleetReference::from_records(vec![
      FleetRecord {
        fleet: "101".to_string(),
        operator: "acme".to_string(),
        registration: "XYZ001".to_string(),
      },
      FleetRecord {
        fleet: "102".to_string(),
        operator: "acme".to_string(),
        registration: "---".to_string(),
      },
    ]);
    let cache = CacheStore::new(SqliteStorage::in_memory().unwrap());
    cache.upsert_batch(entries).await;
    LookupResolver::new(Arc::new(fleet), cache, DEFAULT_THRESHOLD_MS)
  }

  #[tokio::test]
  async fn test_by_fleet_live() {
    let now = now_ms();
    let resolver = resolver(vec![entry(
      "XYZ001",
      Region::Vic,
      now - Duration::seconds(10),
    )])
    .await;

    let status = resolver.by_fleet("101", " ACME ", now).await.unwrap();

    assert_eq!(status.status, Liveness::Live);
    assert_eq!(status.rego, "XYZ001");
    assert_eq!(status.age_ms, 10_000);
    assert_eq!(status.operator.as_deref(), Some("acme"));
  }

  #[tokio::test]
  async fn test_by_fleet_offline_when_stale() {
    let now = now_ms();
    let resolver = resolver(vec![entry(
      "XYZ001",
      Region::Vic,
      now - Duration::minutes(5),
    )])
    .await;

    let status = resolver.by_fleet("101", "acme", now).await.unwrap();
    assert_eq!(status.status, Liveness::Offline);
  }

  #[tokio::test]
  async fn test_by_fleet_missing_outcomes() {
    let resolver = resolver(Vec::new()).await;

    assert!(matches!(
      resolver.by_fleet("999", "acme", now_ms()).await,
      Err(LookupError::FleetNotFound)
    ));
    match resolver.by_fleet("101", "acme", now_ms()).await {
      Err(LookupError::BusNotActive { searching_for }) => assert_eq!(searching_for, "XYZ001"),
      other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
      resolver.by_fleet("102", "acme", now_ms()).await,
      Err(LookupError::BusNotActive { .. })
    ));
  }

  #[tokio::test]
  async fn test_fragment_single_match() {
    let now = now_ms();
    let resolver = resolver(vec![
      entry("AB1234", Region::Nsw, now),
      entry("CD1235", Region::Nsw, now),
    ])
    .await;

    let status = resolver.by_fragment(Region::Nsw, "1234", now).await.unwrap();
    assert_eq!(status.rego, "AB1234");
  }

  #[tokio::test]
  async fn test_fragment_ambiguous_lists_keys() {
    let now = now_ms();
    let resolver = resolver(vec![
      entry("AB1234", Region::Nsw, now),
      entry("CD1234X", Region::Nsw, now),
    ])
    .await;

    match resolver.by_fragment(Region::Nsw, "1234", now).await {
      Err(LookupError::Ambiguous { matches }) => {
        assert_eq!(matches, vec!["AB1234".to_string(), "CD1234X".to_string()])
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_fragment_rejects_bad_shape_and_misses() {
    let now = now_ms();
    let resolver = resolver(vec![entry("AB1234", Region::Nsw, now)]).await;

    for bad in ["123", "12345", "12a4", "", "１２３４"] {
      assert!(matches!(
        resolver.by_fragment(Region::Nsw, bad, now).await,
        Err(LookupError::NotFound)
      ));
    }
    assert!(matches!(
      resolver.by_fragment(Region::Nsw, "9999", now).await,
      Err(LookupError::NotFound)
    ));
    assert!(matches!(
      resolver.by_fragment(Region::Vic, "1234", now).await,
      Err(LookupError::NotFound)
    ));
  }

  #[tokio::test]
  async fn test_exact_normalizes_and_checks_region() {
    let now = now_ms();
    let resolver = resolver(vec![
      entry("AB1234", Region::Nsw, now),
      entry("XYZ001", Region::Vic, now),
    ])
    .await;

    assert_eq!(
      resolver.by_exact(Region::Nsw, "ab-1234", now).await.unwrap().rego,
      "AB1234"
    );
    assert!(matches!(
      resolver.by_exact(Region::Nsw, "XYZ001", now).await,
      Err(LookupError::NotFound)
    ));
  }

  #[tokio::test]
  async fn test_exact_uses_region_scheme() {
    let now = now_ms();
    let resolver = resolver(vec![
      entry("123", Region::Nsw, now),
      entry("XYZ001", Region::Vic, now),
    ])
    .await
    .with_scheme(Region::Nsw, Scheme::FleetComposite)
    .with_scheme(Region::Nsw, Scheme::Registration);

    assert_eq!(
      resolver.by_exact(Region::Nsw, "SBS-0123-A", now).await.unwrap().rego,
      "123"
    );
    assert_eq!(
      resolver.by_exact(Region::Vic, "xyz-001", now).await.unwrap().rego,
      "XYZ001"
    );
  }

  #[tokio::test]
  async fn test_operators() {
    let resolver = resolver(Vec::new()).await;
    assert_eq!(resolver.operators("101").unwrap(), vec!["acme".to_string()]);
    assert!(matches!(
      resolver.operators("404"),
      Err(LookupError::FleetNotFound)
    ));
  }
}
