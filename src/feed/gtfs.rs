use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{FeedSnapshot, FeedSource, RawEntity};
use crate::config::{get_secret, IdField, ProviderConfig};
use crate::error::{DecodeError, FetchError, IngestError, ProviderError};
use crate::types::Position;

/// GTFS-realtime vehicle positions over HTTP
#[derive(Clone)]
pub struct GtfsRealtimeSource {
  name: String,
  url: Url,
  client: reqwest::Client,
  headers: HeaderMap,
  id_field: IdField,
}

impl GtfsRealtimeSource {
  /// Resolve credentials and build the HTTP client.
  ///
  /// Fails when a credential is missing, so an unusable provider never gets
  /// scheduled.
  pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
    let auth = &config.auth;
    let key = get_secret(&auth.env).ok_or_else(|| ProviderError::MissingCredential {
      provider: config.name.clone(),
      env: auth.env.clone(),
    })?;

    let mut headers = HeaderMap::new();
    insert_header(
      &mut headers,
      &config.name,
      &auth.header,
      &format!("{}{}", auth.prefix, key),
    )?;

    if let (Some(header), Some(env)) = (&auth.secret_header, &auth.secret_env) {
      let secret = get_secret(env).ok_or_else(|| ProviderError::MissingCredential {
        provider: config.name.clone(),
        env: env.clone(),
      })?;
      insert_header(&mut headers, &config.name, header, &secret)?;
    }

    Self::with_headers(
      &config.name,
      config.url.clone(),
      headers,
      config.id_field,
      config.fetch_timeout(),
    )
  }

  pub fn with_headers(
    name: &str,
    url: Url,
    headers: HeaderMap,
    id_field: IdField,
    timeout: Duration,
  ) -> Result<Self, ProviderError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|source| ProviderError::Client {
        provider: name.to_string(),
        source,
      })?;

    Ok(Self {
      name: name.to_string(),
      url,
      client,
      headers,
      id_field,
    })
  }
}

fn insert_header(
  headers: &mut HeaderMap,
  provider: &str,
  name: &str,
  value: &str,
) -> Result<(), ProviderError> {
  let invalid = || ProviderError::InvalidHeader {
    provider: provider.to_string(),
    header: name.to_string(),
  };
  let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
  let mut value = HeaderValue::from_str(value).map_err(|_| invalid())?;
  value.set_sensitive(true);
  headers.insert(name, value);
  Ok(())
}

#[async_trait]
impl FeedSource for GtfsRealtimeSource {
  fn name(&self) -> &str {
    &self.name
  }

  async fn fetch(&self) -> Result<FeedSnapshot, IngestError> {
    let transport = |source: reqwest::Error| FetchError::Transport {
      url: self.url.to_string(),
      source,
    };

    let response = self
      .client
      .get(self.url.clone())
      .headers(self.headers.clone())
      .send()
      .await
      .map_err(transport)?;

    let status = response.status();
    if !status.is_success() {
      return Err(
        FetchError::Status {
          url: self.url.to_string(),
          status: status.as_u16(),
        }
        .into(),
      );
    }

    let body = response.bytes().await.map_err(transport)?;
    debug!(provider = %self.name, bytes = body.len(), "feed fetched");

    Ok(decode_feed(&body, self.id_field, Utc::now())?)
  }
}

/// Decode a protobuf `FeedMessage` into a snapshot.
pub(crate) fn decode_feed(
  body: &[u8],
  id_field: IdField,
  received_at: DateTime<Utc>,
) -> Result<FeedSnapshot, DecodeError> {
  let feed = gtfs_rt::FeedMessage::decode(body)?;

  let captured_at = feed
    .header
    .timestamp
    .and_then(from_unix_secs)
    .unwrap_or(received_at);

  let entities = feed
    .entity
    .into_iter()
    .map(|entity| match entity.vehicle {
      Some(vehicle) => RawEntity {
        vehicle_id: vehicle.vehicle.and_then(|v| match id_field {
          IdField::Label => v.label,
          IdField::Id => v.id,
          IdField::LicensePlate => v.license_plate,
        }),
        position: vehicle
          .position
          .and_then(|p| Position::new(p.latitude as f64, p.longitude as f64)),
        timestamp: vehicle.timestamp.and_then(from_unix_secs),
      },
      // Trip updates, alerts and friends carry no position
      None => RawEntity::default(),
    })
    .collect();

  Ok(FeedSnapshot {
    entities,
    captured_at,
    received_at,
  })
}

fn from_unix_secs(secs: u64) -> Option<DateTime<Utc>> {
  DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}
