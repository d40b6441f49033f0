//! Serde types for the push hub protocol.
//!
//! The hub sends JSON text frames holding either one message or an array of
//! messages, each tagged by `type`. Unknown types deserialize to
//! [`HubMessage::Other`] so protocol additions never break the stream.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// ============================================================================
// Client -> hub
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
  Subscribe { filter: SubscribeFilter },
}

/// Empty filter means every vehicle event.
#[derive(Debug, Default, Serialize)]
pub struct SubscribeFilter {
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub vehicles: Vec<String>,
}

impl ClientMessage {
  pub fn subscribe_all() -> Self {
    ClientMessage::Subscribe {
      filter: SubscribeFilter::default(),
    }
  }
}

// ============================================================================
// Hub -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
  VehiclePosition(VehicleEvent),
  VehicleProgress(VehicleEvent),
  /// Door/occupancy style updates, no coordinates
  VehicleStatus(VehicleEvent),
  Heartbeat,
  #[serde(other)]
  Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleEvent {
  /// Composite identifier, e.g. "SBS-0123-A"
  pub vehicle_id: String,
  pub latitude: Option<f64>,
  pub longitude: Option<f64>,
}

impl HubMessage {
  /// The event if this message type carries a position.
  pub fn position_event(&self) -> Option<&VehicleEvent> {
    match self {
      HubMessage::VehiclePosition(event) | HubMessage::VehicleProgress(event) => Some(event),
      HubMessage::VehicleStatus(_) | HubMessage::Heartbeat | HubMessage::Other => None,
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Frame {
  Batch(Vec<HubMessage>),
  Single(HubMessage),
}

/// Parse one text frame into its messages.
pub fn parse_frame(text: &str) -> Result<Vec<HubMessage>, DecodeError> {
  let frame: Frame = serde_json::from_str(text)?;
  Ok(match frame {
    Frame::Batch(messages) => messages,
    Frame::Single(message) => vec![message],
  })
}
