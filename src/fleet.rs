//! Static fleet number to registration table, loaded once at startup.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FleetRecord {
  pub fleet: String,
  pub operator: String,
  #[serde(alias = "rego")]
  pub registration: String,
}

/// Read-only lookup over fleet records, keyed by (fleet number, operator).
#[derive(Debug, Default)]
pub struct FleetReference {
  records: Vec<FleetRecord>,
  /// fleet number -> indices into `records`, in file order
  by_fleet: HashMap<String, Vec<usize>>,
}

fn fleet_key(fleet: &str) -> String {
  fleet.trim().to_string()
}

fn operator_key(operator: &str) -> String {
  operator.trim().to_lowercase()
}

impl FleetReference {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read fleet reference {}: {}", path.display(), e))?;

    let records: Vec<FleetRecord> = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse fleet reference {}: {}", path.display(), e))?;

    Ok(Self::from_records(records))
  }

  /// Build the table. A repeated (fleet, operator) pair keeps its first record.
  pub fn from_records(records: Vec<FleetRecord>) -> Self {
    let mut table = Self::default();

    for record in records {
      let key = fleet_key(&record.fleet);
      let operator = operator_key(&record.operator);
      let slots = table.by_fleet.entry(key).or_default();

      let duplicate = slots
        .iter()
        .any(|&i| operator_key(&table.records[i].operator) == operator);
      if duplicate {
        continue;
      }

      slots.push(table.records.len());
      table.records.push(record);
    }

    table
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Operators running a fleet number. Empty when the fleet is unknown.
  pub fn operators(&self, fleet: &str) -> Vec<&str> {
    self
      .by_fleet
      .get(&fleet_key(fleet))
      .map(|slots| {
        slots
          .iter()
          .map(|&i| self.records[i].operator.as_str())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Find the record for a fleet number and operator.
  ///
  /// Operator matching ignores case and surrounding whitespace.
  pub fn lookup(&self, fleet: &str, operator: &str) -> Option<&FleetRecord> {
    let operator = operator_key(operator);
    self
      .by_fleet
      .get(&fleet_key(fleet))?
      .iter()
      .map(|&i| &self.records[i])
      .find(|r| operator_key(&r.operator) == operator)
  }
}
