//! HTTP surface over the Lookup Resolver.
//!
//! Every response is JSON except the `/` banner. Logical misses are HTTP 200
//! with an `error` field; only store failures become HTTP 500.

use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::CacheStorage;
use crate::resolver::{LookupError, LookupResolver, VehicleStatus};
use crate::status::{IngestStatus, SourceHealth};
use crate::types::Region;

pub const BANNER: &str = "fleetwatch running";

pub struct ApiState<S: CacheStorage> {
  pub resolver: Arc<LookupResolver<S>>,
  pub status: Arc<IngestStatus>,
}

impl<S: CacheStorage> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self {
      resolver: Arc::clone(&self.resolver),
      status: Arc::clone(&self.status),
    }
  }
}

#[derive(Debug, Serialize)]
pub struct OperatorsResponse {
  pub fleet: String,
  pub operators: Vec<String>,
}

impl IntoResponse for LookupError {
  fn into_response(self) -> Response {
    let body = match self {
      LookupError::FleetNotFound => json!({ "error": "fleet_not_found" }),
      LookupError::BusNotActive { searching_for } => json!({
        "error": "bus_not_active",
        "searchingForRego": searching_for,
      }),
      LookupError::NotFound => json!({ "error": "not_found" }),
      LookupError::Ambiguous { matches } => json!({
        "multiple": true,
        "matches": matches,
      }),
      LookupError::Store(e) => {
        error!(error = %e, "lookup failed against the store");
        return (
          StatusCode::INTERNAL_SERVER_ERROR,
          Json(json!({ "error": "server_error" })),
        )
          .into_response();
      }
    };
    (StatusCode::OK, Json(body)).into_response()
  }
}

pub fn router<S: CacheStorage>(state: ApiState<S>) -> Router {
  Router::new()
    .route("/", get(banner))
    .route("/operators/:fleet", get(operators::<S>))
    .route("/bus/:fleet/:operator", get(bus::<S>))
    .route("/nsw/:digits", get(nsw_fragment::<S>))
    .route("/nsw-exact/:rego", get(nsw_exact::<S>))
    .route("/vehicles/:region", get(region_vehicles::<S>))
    .route("/debug", get(debug::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn banner() -> &'static str {
  BANNER
}

async fn operators<S: CacheStorage>(
  State(state): State<ApiState<S>>,
  Path(fleet): Path<String>,
) -> Result<Json<OperatorsResponse>, LookupError> {
  let operators = state.resolver.operators(&fleet)?;
  Ok(Json(OperatorsResponse { fleet, operators }))
}

async fn bus<S: CacheStorage>(
  State(state): State<ApiState<S>>,
  Path((fleet, operator)): Path<(String, String)>,
) -> Result<Json<VehicleStatus>, LookupError> {
  let status = state.resolver.by_fleet(&fleet, &operator, Utc::now()).await?;
  Ok(Json(status))
}

async fn nsw_fragment<S: CacheStorage>(
  State(state): State<ApiState<S>>,
  Path(digits): Path<String>,
) -> Result<Json<VehicleStatus>, LookupError> {
  let status = state
    .resolver
    .by_fragment(Region::Nsw, &digits, Utc::now())
    .await?;
  Ok(Json(status))
}

async fn nsw_exact<S: CacheStorage>(
  State(state): State<ApiState<S>>,
  Path(rego): Path<String>,
) -> Result<Json<VehicleStatus>, LookupError> {
  let status = state.resolver.by_exact(Region::Nsw, &rego, Utc::now()).await?;
  Ok(Json(status))
}

async fn region_vehicles<S: CacheStorage>(
  State(state): State<ApiState<S>>,
  Path(region): Path<String>,
) -> Result<Json<Vec<VehicleStatus>>, LookupError> {
  let region: Region = region.parse().map_err(|_| LookupError::NotFound)?;
  let vehicles = state.resolver.region_vehicles(region, Utc::now()).await?;
  Ok(Json(vehicles))
}

async fn debug<S: CacheStorage>(
  State(state): State<ApiState<S>>,
) -> Json<BTreeMap<String, SourceHealth>> {
  Json(state.status.snapshot())
}
