use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default age after which a position stops being reported as live.
pub const DEFAULT_THRESHOLD_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
  Live,
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessVerdict {
  pub status: Liveness,
  /// Never negative; a timestamp slightly ahead of our clock counts as age 0
  pub age_millis: i64,
}

/// Classify a last-seen time against `now`.
///
/// Live while the age is at most `threshold_ms`.
pub fn classify(last_seen: DateTime<Utc>, now: DateTime<Utc>, threshold_ms: i64) -> LivenessVerdict {
  let age_millis = (now - last_seen).num_milliseconds().max(0);
  let status = if age_millis <= threshold_ms {
    Liveness::Live
  } else {
    Liveness::Offline
  };
  LivenessVerdict { status, age_millis }
}
