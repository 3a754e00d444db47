use crate::error::{internal_error, map_store_error};
use crate::ingest::{IngestReport, IngestStatsSnapshot, WeatherIngestor};
use crate::query::{self, BucketAggregate, GroupKey, Rollup};
use crate::record::{batch_from_value, Record};
use crate::store::StoreStats;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tower_http::cors::{Any, CorsLayer};

const DEFAULT_WINDOW_SECONDS: i64 = 3600;
const DEFAULT_BUCKET_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct HttpState {
    pub ingestor: WeatherIngestor,
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    window_seconds: Option<i64>,
    now: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
    bucket_seconds: Option<i64>,
    rollup: Option<String>,
    window_seconds: Option<i64>,
    now: Option<i64>,
    group_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct LatestResponse {
    hostname: String,
    record: Option<Record>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ingest: IngestStatsSnapshot,
    store: StoreStats,
    devices: usize,
}

/// Rejects second counts that do not fit a `chrono::Duration`.
fn seconds_param(name: &str, seconds: i64) -> Result<ChronoDuration, (StatusCode, String)> {
    ChronoDuration::try_seconds(seconds).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("{name} out of range: {seconds}"),
        )
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_ingest(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> Result<Json<IngestReport>, (StatusCode, String)> {
    let batch = batch_from_value(payload);
    let ingestor = state.ingestor.clone();
    let report = tokio::task::spawn_blocking(move || ingestor.ingest(&batch))
        .await
        .map_err(internal_error)?
        .map_err(map_store_error)?;
    Ok(Json(report))
}

async fn get_latest_all(State(state): State<HttpState>) -> Json<BTreeMap<String, Record>> {
    Json(state.ingestor.latest().get_all())
}

async fn get_latest(
    State(state): State<HttpState>,
    Path(hostname): Path<String>,
) -> Json<LatestResponse> {
    let record = state.ingestor.latest().get(&hostname);
    Json(LatestResponse { hostname, record })
}

async fn get_recent(
    State(state): State<HttpState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<Record>>, (StatusCode, String)> {
    let window = seconds_param(
        "window_seconds",
        params.window_seconds.unwrap_or(DEFAULT_WINDOW_SECONDS),
    )?;
    let now = params.now.unwrap_or_else(|| Utc::now().timestamp());
    let store = state.ingestor.store().clone();
    let records = tokio::task::spawn_blocking(move || query::recent(&store, window, now))
        .await
        .map_err(internal_error)?
        .map_err(map_store_error)?;
    Ok(Json(records))
}

async fn get_aggregate(
    State(state): State<HttpState>,
    Query(params): Query<AggregateQuery>,
) -> Result<Json<Vec<BucketAggregate>>, (StatusCode, String)> {
    let group_key = match params.group_by.as_deref() {
        Some(raw) => raw
            .parse::<GroupKey>()
            .map_err(|err| (StatusCode::BAD_REQUEST, err))?,
        None => GroupKey::Hostname,
    };
    let rollup = params
        .rollup
        .as_deref()
        .map(str::parse::<Rollup>)
        .transpose()
        .map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let bucket_seconds = params.bucket_seconds.unwrap_or(DEFAULT_BUCKET_SECONDS);
    if rollup.is_none() && bucket_seconds <= 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "bucket_seconds must be positive".to_string(),
        ));
    }
    let bucket_size = seconds_param("bucket_seconds", bucket_seconds)?;
    let window = seconds_param(
        "window_seconds",
        params.window_seconds.unwrap_or(DEFAULT_WINDOW_SECONDS),
    )?;
    let now = params.now.unwrap_or_else(|| Utc::now().timestamp());

    let store = state.ingestor.store().clone();
    let buckets = tokio::task::spawn_blocking(move || match rollup {
        Some(rollup) => query::rollup(&store, rollup, window, now, group_key),
        None => query::bucket_aggregate(&store, bucket_size, window, now, group_key),
    })
    .await
    .map_err(internal_error)?
    .map_err(map_store_error)?;
    Ok(Json(buckets))
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ingest: state.ingestor.stats().snapshot(),
        store: state.ingestor.store_stats(),
        devices: state.ingestor.latest().len(),
    })
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/ingest", post(post_ingest))
        .route("/v1/latest", get(get_latest_all))
        .route("/v1/latest/{hostname}", get(get_latest))
        .route("/v1/recent", get(get_recent))
        .route("/v1/aggregate", get(get_aggregate))
        .layer(cors)
        .with_state(state)
}
