//! Error taxonomy for the ingestion and storage paths.
//!
//! Ingestion errors are contained inside the tick or session that raised them;
//! the next tick is the retry. Lookup outcomes live in `resolver::LookupError`.

use std::time::Duration;
use thiserror::Error;

/// Network or HTTP failure while fetching a feed snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("fetch did not complete within {0:?}")]
  Timeout(Duration),

  #[error("push hub connection failed: {0}")]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Payload arrived but could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("malformed GTFS-realtime payload: {0}")]
  Protobuf(#[from] prost::DecodeError),

  #[error("malformed push hub frame: {0}")]
  Json(#[from] serde_json::Error),
}

/// Persistence failure in the cache store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("cache store lock poisoned")]
  LockPoisoned,

  #[error("blocking store task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  #[error("corrupt cache row for {key}: {reason}")]
  Corrupt { key: String, reason: String },

  #[error("failed to open cache database at {path}: {reason}")]
  Open { path: String, reason: String },
}

/// Anything that can abort one poll tick or push frame.
#[derive(Debug, Error)]
pub enum IngestError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// A provider could not be constructed; it is skipped rather than scheduled.
#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("{provider}: credential not found, set {env}")]
  MissingCredential { provider: String, env: String },

  #[error("{provider}: invalid value for header {header}")]
  InvalidHeader { provider: String, header: String },

  #[error("{provider}: failed to build HTTP client: {source}")]
  Client {
    provider: String,
    #[source]
    source: reqwest::Error,
  },
}
