//! Decoded feed snapshots and the sources that produce them.
//!
//! Provider payloads are flattened into [`RawEntity`] once, at the decoding
//! boundary. Everything downstream matches on which fields are present.

mod gtfs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::types::Position;

pub use gtfs::GtfsRealtimeSource;

/// One feed entity, reduced to the fields ingestion cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntity {
  pub vehicle_id: Option<String>,
  pub position: Option<Position>,
  pub timestamp: Option<DateTime<Utc>>,
}

/// Entities in feed order, plus when the snapshot was taken.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
  pub entities: Vec<RawEntity>,
  /// Feed header timestamp, else the local receipt time
  pub captured_at: DateTime<Utc>,
  /// Local clock when the payload arrived
  pub received_at: DateTime<Utc>,
}

/// Something that can produce a decoded snapshot on demand.
///
/// A decode failure is a single error; partial results are never returned.
#[async_trait]
pub trait FeedSource: Send + Sync {
  fn name(&self) -> &str;

  async fn fetch(&self) -> Result<FeedSnapshot, IngestError>;
}
