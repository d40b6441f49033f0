//! Periodic feed polling into the cache store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, CacheStore, UpsertSummary};
use crate::config::ProviderConfig;
use crate::error::{FetchError, IngestError, ProviderError};
use crate::feed::{FeedSnapshot, FeedSource, GtfsRealtimeSource};
use crate::identity::{normalize, Scheme};
use crate::status::IngestStatus;
use crate::types::{CacheEntry, Region, VehicleReport};

/// One upstream provider, polled on a fixed interval.
pub struct FeedPoller<S: CacheStorage> {
  source: Arc<dyn FeedSource>,
  scheme: Scheme,
  region: Region,
  interval: Duration,
  fetch_timeout: Duration,
  cache: CacheStore<S>,
  status: Arc<IngestStatus>,
}

impl<S: CacheStorage> FeedPoller<S> {
  /// Build a GTFS-realtime poller. A missing credential fails here, not per tick.
  pub fn from_config(
    config: &ProviderConfig,
    cache: CacheStore<S>,
    status: Arc<IngestStatus>,
  ) -> Result<Self, ProviderError> {
    let source = GtfsRealtimeSource::new(config)?;
    Ok(Self {
      source: Arc::new(source),
      scheme: config.scheme,
      region: config.region,
      interval: config.poll_interval(),
      fetch_timeout: config.fetch_timeout(),
      cache,
      status,
    })
  }

  pub fn new(
    source: Arc<dyn FeedSource>,
    scheme: Scheme,
    region: Region,
    interval: Duration,
    cache: CacheStore<S>,
    status: Arc<IngestStatus>,
  ) -> Self {
    Self {
      source,
      scheme,
      region,
      interval,
      fetch_timeout: interval.mul_f64(0.9),
      cache,
      status,
    }
  }

  pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
    self.fetch_timeout = fetch_timeout;
    self
  }

  pub fn name(&self) -> &str {
    self.source.name()
  }

  pub fn region(&self) -> Region {
    self.region
  }

  /// Fetch one snapshot and write its reports as a single batch.
  ///
  /// Fetch and decode failures return before anything is written.
  pub async fn tick(&self) -> Result<UpsertSummary, IngestError> {
    let snapshot = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
      .await
      .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;

    let entities = snapshot.entities.len();
    let reports = collect_reports(snapshot, self.scheme, self.region);
    debug!(
      provider = %self.name(),
      entities,
      reports = reports.len(),
      "snapshot reduced"
    );

    let entries: Vec<CacheEntry> = reports.into_iter().map(CacheEntry::from).collect();
    Ok(self.cache.upsert_batch(entries).await)
  }

  async fn run_tick(&self) {
    match self.tick().await {
      Ok(summary) => {
        info!(
          provider = %self.name(),
          written = summary.written,
          stale = summary.stale,
          failed_rows = summary.failed_rows,
          "poll tick complete"
        );
        self.status.record_success(self.name(), summary);
      }
      Err(e) => {
        warn!(provider = %self.name(), error = %e, "poll tick aborted");
        self.status.record_failure(self.name(), &e);
      }
    }
  }

  /// Run forever on the poller's interval.
  ///
  /// Ticks are awaited in sequence and missed ticks are skipped, so a slow
  /// upstream never causes overlapping fetches.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        ticker.tick().await;
        self.run_tick().await;
      }
    })
  }
}

/// Reduce a snapshot to one report per identity.
///
/// Entities without an identifier or position are dropped. When a vehicle
/// appears more than once, the later entity wins. Capture times never run
/// ahead of receipt time; a future-dated row would otherwise reject every
/// later write for that key.
pub fn collect_reports(snapshot: FeedSnapshot, scheme: Scheme, region: Region) -> Vec<VehicleReport> {
  let mut reports: Vec<VehicleReport> = Vec::new();
  let mut slots: HashMap<String, usize> = HashMap::new();

  for entity in snapshot.entities {
    let (Some(raw_id), Some(position)) = (entity.vehicle_id, entity.position) else {
      continue;
    };

    let identity_key = normalize(&raw_id, scheme);
    if identity_key.is_empty() {
      debug!(raw_id = %raw_id, "dropping entity with unusable identifier");
      continue;
    }

    let report = VehicleReport {
      identity_key: identity_key.clone(),
      region,
      position,
      captured_at: entity
        .timestamp
        .unwrap_or(snapshot.captured_at)
        .min(snapshot.received_at),
    };

    match slots.get(&identity_key) {
      Some(&slot) => reports[slot] = report,
      None => {
        slots.insert(identity_key, reports.len());
        reports.push(report);
      }
    }
  }

  reports
}
