//! Canonical identity keys for vehicles.
//!
//! Every source funnels its raw identifier through [`normalize`] before a
//! report reaches the cache, so the same bus reported by two feeds (or by the
//! same feed with different padding) lands on one cache row.

use serde::Deserialize;

/// How a provider spells its vehicle identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
  /// Number plates, e.g. "xyz-001", "0123 AB"
  #[default]
  Registration,
  /// Operator composites, e.g. "SBS-0123-A" where the second segment is the fleet number
  FleetComposite,
}

const SEPARATORS: [char; 2] = ['-', '_'];

/// Normalize a raw identifier into an identity key.
///
/// Returns an empty string when nothing usable is left; callers discard
/// such reports.
pub fn normalize(raw: &str, scheme: Scheme) -> String {
  match scheme {
    Scheme::Registration => canonical(raw),
    Scheme::FleetComposite => canonical(fleet_segment(raw)),
  }
}

fn fleet_segment(raw: &str) -> &str {
  let mut segments = raw.trim().split(SEPARATORS);
  let first = segments.next().unwrap_or_default();
  segments.next().unwrap_or(first)
}

fn canonical(raw: &str) -> String {
  let cleaned: String = raw
    .chars()
    .filter(char::is_ascii_alphanumeric)
    .map(|c| c.to_ascii_uppercase())
    .collect();
  cleaned.trim_start_matches('0').to_string()
}
