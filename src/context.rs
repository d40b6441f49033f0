//! Process-scoped wiring.
//!
//! Built once at startup in a fixed order: fleet reference, store, then the
//! ingestion tasks, then the HTTP router. Everything shared lives here and is
//! handed out explicitly.

use axum::Router;
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheStore, SqliteStorage};
use crate::config::Config;
use crate::fleet::FleetReference;
use crate::poller::FeedPoller;
use crate::push::{PushAdapter, SOURCE_NAME as PUSH_SOURCE};
use crate::resolver::LookupResolver;
use crate::server::{self, ApiState};
use crate::status::{IngestStatus, SourceKind};

pub struct AppContext {
  config: Config,
  cache: CacheStore<SqliteStorage>,
  status: Arc<IngestStatus>,
  resolver: Arc<LookupResolver<SqliteStorage>>,
  ingestion_started: AtomicBool,
}

impl AppContext {
  pub fn new(config: Config) -> Result<Self> {
    let fleet = FleetReference::load(&config.fleet_reference)?;
    info!(
      path = %config.fleet_reference.display(),
      records = fleet.len(),
      "fleet reference loaded"
    );
    if fleet.is_empty() {
      warn!("fleet reference is empty; fleet number lookups will all miss");
    }

    let storage = SqliteStorage::open(config.store.path.as_deref())?;
    Ok(Self::from_parts(config, fleet, storage))
  }

  pub fn from_parts(config: Config, fleet: FleetReference, storage: SqliteStorage) -> Self {
    let cache = CacheStore::new(storage).with_max_batch(config.store.max_batch);
    let resolver = config.providers.iter().fold(
      LookupResolver::new(
        Arc::new(fleet),
        cache.clone(),
        config.freshness.threshold_ms,
      ),
      |resolver, provider| resolver.with_scheme(provider.region, provider.scheme),
    );

    Self {
      config,
      cache,
      status: Arc::new(IngestStatus::new()),
      resolver: Arc::new(resolver),
      ingestion_started: AtomicBool::new(false),
    }
  }

  pub fn status(&self) -> Arc<IngestStatus> {
    self.status.clone()
  }

  /// Spawn one poller per provider and the push adapter, if configured.
  ///
  /// Only the first call spawns anything. A source whose credential is
  /// missing is logged, marked disabled and skipped; the others still start.
  pub fn start_ingestion(&self) -> Vec<JoinHandle<()>> {
    if self.ingestion_started.swap(true, Ordering::SeqCst) {
      warn!("ingestion already started");
      return Vec::new();
    }

    let mut handles = Vec::new();

    for provider in &self.config.providers {
      match FeedPoller::from_config(provider, self.cache.clone(), self.status.clone()) {
        Ok(poller) => {
          self
            .status
            .register(&provider.name, SourceKind::Poller, provider.region);
          info!(
            provider = %provider.name,
            region = %poller.region(),
            interval_secs = provider.poll_interval().as_secs(),
            "starting poller"
          );
          handles.push(poller.spawn());
        }
        Err(e) => {
          warn!(provider = %provider.name, error = %e, "poller disabled");
          self.status.disable(
            &provider.name,
            SourceKind::Poller,
            provider.region,
            &e.to_string(),
          );
        }
      }
    }

    if let Some(push) = &self.config.push {
      match PushAdapter::from_config(push, self.cache.clone(), self.status.clone()) {
        Ok(adapter) => {
          self
            .status
            .register(PUSH_SOURCE, SourceKind::Push, adapter.region());
          info!(url = %push.url, "starting push adapter");
          handles.push(adapter.spawn());
        }
        Err(e) => {
          warn!(error = %e, "push adapter disabled");
          self
            .status
            .disable(PUSH_SOURCE, SourceKind::Push, push.region, &e.to_string());
        }
      }
    }

    handles
  }

  pub fn router(&self) -> Router {
    server::router(ApiState {
      resolver: self.resolver.clone(),
      status: self.status.clone(),
    })
  }
}
