//! Per-source ingestion health, reported by pollers and the push adapter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::cache::UpsertSummary;
use crate::types::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  Poller,
  Push,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
  pub kind: SourceKind,
  pub region: Region,
  /// False when the source was skipped at startup
  pub enabled: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub disabled_reason: Option<String>,
  /// Push hub only
  #[serde(skip_serializing_if = "Option::is_none")]
  pub connected: Option<bool>,
  pub last_ok_at: Option<DateTime<Utc>>,
  pub last_batch: Option<UpsertSummary>,
  pub last_error: Option<String>,
  pub last_error_at: Option<DateTime<Utc>>,
}

impl SourceHealth {
  fn new(kind: SourceKind, region: Region) -> Self {
    Self {
      kind,
      region,
      enabled: true,
      disabled_reason: None,
      connected: match kind {
        SourceKind::Push => Some(false),
        SourceKind::Poller => None,
      },
      last_ok_at: None,
      last_batch: None,
      last_error: None,
      last_error_at: None,
    }
  }
}

#[derive(Debug, Default)]
pub struct IngestStatus {
  sources: RwLock<BTreeMap<String, SourceHealth>>,
}

impl IngestStatus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, name: &str, kind: SourceKind, region: Region) {
    self.write(|sources| {
      sources.insert(name.to_string(), SourceHealth::new(kind, region));
    });
  }

  pub fn disable(&self, name: &str, kind: SourceKind, region: Region, reason: &str) {
    self.write(|sources| {
      let mut health = SourceHealth::new(kind, region);
      health.enabled = false;
      health.disabled_reason = Some(reason.to_string());
      sources.insert(name.to_string(), health);
    });
  }

  pub fn record_success(&self, name: &str, summary: UpsertSummary) {
    self.update(name, |health| {
      health.last_ok_at = Some(Utc::now());
      health.last_batch = Some(summary);
    });
  }

  pub fn record_failure(&self, name: &str, error: &dyn std::fmt::Display) {
    self.update(name, |health| {
      health.last_error = Some(error.to_string());
      health.last_error_at = Some(Utc::now());
    });
  }

  pub fn set_connected(&self, name: &str, connected: bool) {
    self.update(name, |health| health.connected = Some(connected));
  }

  pub fn snapshot(&self) -> BTreeMap<String, SourceHealth> {
    self
      .sources
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn update(&self, name: &str, f: impl FnOnce(&mut SourceHealth)) {
    self.write(|sources| {
      if let Some(health) = sources.get_mut(name) {
        f(health);
      }
    });
  }

  fn write(&self, f: impl FnOnce(&mut BTreeMap<String, SourceHealth>)) {
    let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut sources);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_success_and_failure_are_tracked_separately() {
    let status = IngestStatus::new();
    status.register("vic", SourceKind::Poller, Region::Vic);

    status.record_failure("vic", &"HTTP 500");
    status.record_success(
      "vic",
      UpsertSummary {
        written: 3,
        ..Default::default()
      },
    );

    let vic = &status.snapshot()["vic"];
    assert_eq!(vic.last_error.as_deref(), Some("HTTP 500"));
    assert_eq!(vic.last_batch.as_ref().unwrap().written, 3);
    assert!(vic.last_ok_at.is_some());
    assert_eq!(vic.connected, None);
  }

  #[test]
  fn test_disabled_source_and_unknown_names() {
    let status = IngestStatus::new();
    status.disable("nsw", SourceKind::Poller, Region::Nsw, "missing credential");
    status.set_connected("nobody", true);

    let snapshot = status.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot["nsw"].enabled);
  }
}
