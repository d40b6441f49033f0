//! Push hub ingestion.
//!
//! Holds one websocket subscription to the premium hub, reconnecting with
//! backoff whenever it drops. Each position event becomes a single-record
//! upsert keyed in the fleet-number key space. No reports are synthesized
//! while disconnected.

mod messages;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore};
use crate::config::{get_secret, PushConfig, ReconnectConfig};
use crate::error::{DecodeError, FetchError, IngestError, ProviderError};
use crate::identity::{normalize, Scheme};
use crate::status::IngestStatus;
use crate::types::{CacheEntry, Position, Region, VehicleReport};

pub use messages::{parse_frame, ClientMessage, HubMessage};

/// Name the push source reports under in ingestion status.
pub const SOURCE_NAME: &str = "push";

pub struct PushAdapter<S: CacheStorage> {
  url: Url,
  auth: HeaderValue,
  region: Region,
  reconnect: ReconnectConfig,
  cache: CacheStore<S>,
  status: Arc<IngestStatus>,
}

impl<S: CacheStorage> PushAdapter<S> {
  pub fn from_config(
    config: &PushConfig,
    cache: CacheStore<S>,
    status: Arc<IngestStatus>,
  ) -> Result<Self, ProviderError> {
    let token = get_secret(&config.token_env).ok_or_else(|| ProviderError::MissingCredential {
      provider: SOURCE_NAME.to_string(),
      env: config.token_env.clone(),
    })?;

    Self::new(
      config.url.clone(),
      &token,
      config.region,
      config.reconnect.clone(),
      cache,
      status,
    )
  }

  pub fn new(
    url: Url,
    token: &str,
    region: Region,
    reconnect: ReconnectConfig,
    cache: CacheStore<S>,
    status: Arc<IngestStatus>,
  ) -> Result<Self, ProviderError> {
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
      ProviderError::InvalidHeader {
        provider: SOURCE_NAME.to_string(),
        header: AUTHORIZATION.to_string(),
      }
    })?;
    auth.set_sensitive(true);

    Ok(Self {
      url,
      auth,
      region,
      reconnect,
      cache,
      status,
    })
  }

  pub fn region(&self) -> Region {
    self.region
  }

  /// Handle one text frame; returns how many positions were written.
  pub async fn handle_frame(&self, text: &str, received_at: DateTime<Utc>) -> Result<usize, IngestError> {
    let messages = parse_frame(text)?;
    let mut written = 0;
    let mut failed = 0;

    for report in position_reports(&messages, self.region, received_at) {
      let summary = self.cache.upsert_batch(vec![CacheEntry::from(report)]).await;
      written += summary.written;
      failed += summary.failed_rows;
    }

    if failed > 0 {
      warn!(failed, "push positions could not be stored");
      self.status.record_failure(
        SOURCE_NAME,
        &format!("{} push positions could not be stored", failed),
      );
    }

    Ok(written)
  }

  /// One connection lifetime: connect, subscribe, consume until the hub goes away.
  async fn session(&self) -> Result<(), IngestError> {
    let mut request = self
      .url
      .as_str()
      .into_client_request()
      .map_err(FetchError::from)?;
    request.headers_mut().insert(AUTHORIZATION, self.auth.clone());

    let (mut stream, _) = tokio_tungstenite::connect_async(request)
      .await
      .map_err(FetchError::from)?;
    self.status.set_connected(SOURCE_NAME, true);
    info!(url = %self.url, "push hub connected");

    let subscribe =
      serde_json::to_string(&ClientMessage::subscribe_all()).map_err(DecodeError::from)?;
    stream
      .send(Message::Text(subscribe))
      .await
      .map_err(FetchError::from)?;

    while let Some(message) = stream.next().await {
      match message.map_err(FetchError::from)? {
        Message::Text(text) => match self.handle_frame(&text, Utc::now()).await {
          Ok(written) => debug!(written, "push frame applied"),
          Err(e) => {
            warn!(error = %e, "push frame dropped");
            self.status.record_failure(SOURCE_NAME, &e);
          }
        },
        Message::Close(_) => break,
        _ => {}
      }
    }

    Ok(())
  }

  /// Keep the subscription alive for the life of the process.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut backoff = self.reconnect.initial_ms;

      loop {
        let started = std::time::Instant::now();
        let result = self.session().await;
        self.status.set_connected(SOURCE_NAME, false);

        match result {
          Ok(()) => info!("push hub closed the connection"),
          Err(e) => {
            warn!(error = %e, "push hub connection lost");
            self.status.record_failure(SOURCE_NAME, &e);
          }
        }

        // A session that stayed up for a while resets the backoff
        if started.elapsed() > Duration::from_millis(self.reconnect.max_ms) {
          backoff = self.reconnect.initial_ms;
        }

        let delay = jittered_backoff(backoff, self.reconnect.jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let next = (backoff as f64 * self.reconnect.multiplier) as u64;
        backoff = next.min(self.reconnect.max_ms);
      }
    })
  }
}

/// Position-bearing events as reports stamped with local receipt time.
pub fn position_reports(
  messages: &[HubMessage],
  region: Region,
  received_at: DateTime<Utc>,
) -> Vec<VehicleReport> {
  messages
    .iter()
    .filter_map(HubMessage::position_event)
    .filter_map(|event| {
      let position = Position::new(event.latitude?, event.longitude?)?;
      let identity_key = normalize(&event.vehicle_id, Scheme::FleetComposite);
      if identity_key.is_empty() {
        debug!(vehicle_id = %event.vehicle_id, "dropping push event with unusable identifier");
        return None;
      }
      Some(VehicleReport {
        identity_key,
        region,
        position,
        captured_at: received_at,
      })
    })
    .collect()
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
  if jitter_ms == 0 {
    return base_ms;
  }
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_else(|_| Duration::from_nanos(0))
    .subsec_nanos() as u64;
  base_ms.saturating_add(nanos % jitter_ms)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{RecordingStorage, SqliteStorage};
  use crate::status::SourceKind;
  use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
  use axum::{routing::get, Router};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
  }

  fn adapter<S: CacheStorage>(url: Url, cache: CacheStore<S>, status: Arc<IngestStatus>) -> PushAdapter<S> {
    PushAdapter::new(
      url,
      "token",
      Region::Vic,
      ReconnectConfig {
        initial_ms: 10,
        max_ms: 50,
        multiplier: 2.0,
        jitter_ms: 0,
      },
      cache,
      status,
    )
    .unwrap()
  }

  #[test]
  fn test_position_reports_filters_and_normalizes() {
    let messages = parse_frame(
      r#"[
        {"type": "vehiclePosition", "vehicleId": "SBS-0123-A", "latitude": -37.81, "longitude": 144.96},
        {"type": "vehicleStatus", "vehicleId": "SBS-0456-A"},
        {"type": "vehicleProgress", "vehicleId": "SBS-0789-B", "latitude": -37.82},
        {"type": "vehicleProgress", "vehicleId": "SBS--B", "latitude": -37.82, "longitude": 144.9},
        {"type": "heartbeat"}
      ]"#,
    )
    .unwrap();
    let at = now_ms();

    let reports = position_reports(&messages, Region::Vic, at);

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].identity_key, "123");
    assert_eq!(reports[0].captured_at, at);
    assert_eq!(reports[0].region, Region::Vic);
  }

  #[tokio::test]
  async fn test_handle_frame_upserts_each_event() {
    let cache = CacheStore::new(SqliteStorage::in_memory().unwrap());
    let push = adapter(
      Url::parse("ws://127.0.0.1:1/hub").unwrap(),
      cache.clone(),
      Arc::new(IngestStatus::new()),
    );

    let written = push
      .handle_frame(
        r#"[
          {"type": "vehiclePosition", "vehicleId": "SBS-0123-A", "latitude": -37.81, "longitude": 144.96},
          {"type": "vehiclePosition", "vehicleId": "CDC-0124-A", "latitude": -37.70, "longitude": 144.90}
        ]"#,
        now_ms(),
      )
      .await
      .unwrap();

    assert_eq!(written, 2);
    assert_eq!(cache.get_by_region(Region::Vic).await.unwrap().len(), 2);
    assert!(push.handle_frame("{broken", now_ms()).await.is_err());
  }

  #[tokio::test]
  async fn test_store_failure_reaches_status() {
    let status = Arc::new(IngestStatus::new());
    status.register(SOURCE_NAME, SourceKind::Push, Region::Vic);
    let push = adapter(
      Url::parse("ws://127.0.0.1:1/hub").unwrap(),
      CacheStore::new(RecordingStorage::new("123")),
      status.clone(),
    );

    let written = push
      .handle_frame(
        r#"[
          {"type": "vehiclePosition", "vehicleId": "SBS-0123-A", "latitude": -37.81, "longitude": 144.96},
          {"type": "vehiclePosition", "vehicleId": "CDC-0124-A", "latitude": -37.70, "longitude": 144.90}
        ]"#,
        now_ms(),
      )
      .await
      .unwrap();

    assert_eq!(written, 1);
    let snapshot = status.snapshot();
    let health = &snapshot[SOURCE_NAME];
    assert!(health.last_error.as_deref().unwrap().contains("1 push positions"));
    assert!(health.last_error_at.is_some());
  }

  async fn hub(mut socket: WebSocket, connections: Arc<AtomicUsize>) {
    connections.fetch_add(1, Ordering::SeqCst);

    // First message must be the subscription
    match socket.recv().await {
      Some(Ok(WsMessage::Text(text))) if text.contains("subscribe") => {}
      _ => return,
    }

    let frame = r#"[{"type": "vehiclePosition", "vehicleId": "SBS-0123-A", "latitude": -37.81, "longitude": 144.96}]"#;
    let _ = socket.send(WsMessage::Text(frame.to_string())).await;
    let _ = socket.send(WsMessage::Close(None)).await;
  }

  #[tokio::test]
  async fn test_subscribes_ingests_and_reconnects() {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let router = Router::new().route(
      "/hub",
      get(move |ws: WebSocketUpgrade| {
        let counter = counter.clone();
        async move { ws.on_upgrade(move |socket| hub(socket, counter)) }
      }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });

    let cache = CacheStore::new(SqliteStorage::in_memory().unwrap());
    let status = Arc::new(IngestStatus::new());
    status.register(SOURCE_NAME, SourceKind::Push, Region::Vic);
    let url = Url::parse(&format!("ws://{}/hub", addr)).unwrap();
    let handle = adapter(url, cache.clone(), status.clone()).spawn();

    let mut found = None;
    for _ in 0..100 {
      tokio::time::sleep(Duration::from_millis(20)).await;
      found = cache.get_by_key("123").await.unwrap();
      if found.is_some() && connections.load(Ordering::SeqCst) >= 2 {
        break;
      }
    }
    handle.abort();

    let entry = found.expect("push event was not ingested");
    assert_eq!(entry.region, Region::Vic);
    assert!(connections.load(Ordering::SeqCst) >= 2);
  }
}
