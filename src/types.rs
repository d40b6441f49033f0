use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Regional partition a vehicle was reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
  #[serde(alias = "vic")]
  Vic,
  #[serde(alias = "nsw")]
  Nsw,
}

impl Region {
  pub fn as_str(&self) -> &'static str {
    match self {
      Region::Vic => "VIC",
      Region::Nsw => "NSW",
    }
  }
}

impl fmt::Display for Region {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Region {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "VIC" => Ok(Region::Vic),
      "NSW" => Ok(Region::Nsw),
      other => Err(format!("unknown region '{}'", other)),
    }
  }
}

/// WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub latitude: f64,
  pub longitude: f64,
}

impl Position {
  /// Build a position, rejecting NaN/infinite coordinates.
  pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
    if latitude.is_finite() && longitude.is_finite() {
      Some(Self {
        latitude,
        longitude,
      })
    } else {
      None
    }
  }
}

/// One normalized observation on its way from a source to the cache
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleReport {
  pub identity_key: String,
  pub region: Region,
  pub position: Position,
  pub captured_at: DateTime<Utc>,
}

/// Latest known position for one vehicle identity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub identity_key: String,
  pub region: Region,
  pub latitude: f64,
  pub longitude: f64,
  pub last_seen: DateTime<Utc>,
}

impl From<VehicleReport> for CacheEntry {
  fn from(report: VehicleReport) -> Self {
    Self {
      identity_key: report.identity_key,
      region: report.region,
      latitude: report.position.latitude,
      longitude: report.position.longitude,
      last_seen: report.captured_at,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_region_parse_is_case_insensitive() {
    assert_eq!("nsw".parse::<Region>(), Ok(Region::Nsw));
    assert_eq!(" VIC ".parse::<Region>(), Ok(Region::Vic));
    assert!("qld".parse::<Region>().is_err());
  }

  #[test]
  fn test_position_rejects_non_finite() {
    assert!(Position::new(f64::NAN, 144.9).is_none());
    assert!(Position::new(-37.8, f64::INFINITY).is_none());
    assert!(Position::new(-37.8, 144.9).is_some());
  }
}
