use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{
    cache::{keys, RedisCache},
    config::Config,
    errors::EngineError,
    join::{JoinHandler, JoinRequest},
    ledger::Ledger,
    metrics::Metrics,
    oracle::OracleSource,
    security::{constant_time_eq, extract_client_ip},
    settlement::SettlementEngine,
};

/// Lag past which the public status flips to degraded.
const DEGRADED_LAG_MS: i64 = 60_000;

pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<dyn Ledger>,
    pub oracle: Arc<OracleSource>,
    pub engine: Arc<SettlementEngine>,
    pub join: JoinHandler,
    pub cache: RedisCache,
    pub metrics: Metrics,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
    #[serde(rename = "retryAfterSec", skip_serializing_if = "Option::is_none")]
    retry_after_sec: Option<u64>,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) | EngineError::Replay => StatusCode::BAD_REQUEST,
            EngineError::Auth => StatusCode::UNAUTHORIZED,
            EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Paused(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            retry_after_sec: err.retry_after_secs(),
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(&self)).into_response();
        if let Some(secs) = self.retry_after_sec {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        error: err.to_string(),
        retry_after_sec: None,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/entries", post(submit_entry))
        .route("/oracle", get(oracle_snapshot))
        .route("/settle", post(settle))
        .route("/status", get(status))
        .route("/ops/health", get(ops_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let body = state.metrics.render().map_err(internal)?;
    Ok((StatusCode::OK, body))
}

#[derive(Debug, Serialize)]
struct EntryResponse {
    ok: bool,
    created: bool,
}

pub async fn submit_entry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
    Json(req): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();
    let ip = extract_client_ip(&headers, connect_info.as_ref());
    let now_ms = Utc::now().timestamp_millis();

    let outcome = state.join.submit(&req, &ip, now_ms).await?;
    state.metrics.observe_request("entries", start.elapsed());
    Ok((
        StatusCode::OK,
        Json(EntryResponse { ok: true, created: outcome.created }),
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleQuery {
    pub market: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OracleView {
    market: String,
    asset: String,
    source: String,
    feed_id: String,
    price: i64,
    confidence: u64,
    publish_time: i64,
    fetched_at: i64,
}

pub async fn oracle_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OracleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();
    let market = state
        .config
        .market(&query.market)
        .ok_or_else(|| ApiError::from(EngineError::validation("unknown market")))?
        .clone();

    let cache_key = keys::api_oracle(&market.symbol);
    // Cache errors degrade to a direct fetch; the endpoint stays up when
    // redis is down.
    if let Ok(Some(cached)) = state.cache.get_json::<OracleView>(&cache_key).await {
        state.metrics.observe_request("oracle", start.elapsed());
        return Ok((StatusCode::OK, Json(cached)));
    }

    let now = Utc::now().timestamp();
    let snapshot = state
        .oracle
        .snapshot_at(&market, now)
        .await
        .map_err(EngineError::from)?;
    let view = OracleView {
        market: market.symbol.clone(),
        asset: market.asset.clone(),
        source: "pyth".to_string(),
        feed_id: market.feed_id.clone(),
        price: snapshot.price,
        confidence: snapshot.confidence,
        publish_time: snapshot.publish_time,
        fetched_at: Utc::now().timestamp_millis(),
    };
    let ttl = Duration::from_millis(state.config.status_cache_ms.max(1000));
    if let Err(err) = state.cache.set_json(&cache_key, &view, ttl).await {
        tracing::debug!("oracle cache write skipped: {err}");
    }
    state.metrics.observe_request("oracle", start.elapsed());
    Ok((StatusCode::OK, Json(view)))
}

#[derive(Debug, Serialize)]
struct SettleResponse {
    ok: bool,
    settled: Vec<String>,
}

pub async fn settle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let provided = headers
        .get("x-settle-key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, &state.config.settle_key) {
        return Err(EngineError::Auth.into());
    }

    let now = Utc::now().timestamp();
    let settled = state.engine.settle_due_rounds(now).await?;
    Ok((StatusCode::OK, Json(SettleResponse { ok: true, settled })))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub ok: bool,
    pub status: String,
    pub joins_paused: bool,
    pub settlement_paused: bool,
    pub pending_due_rounds: usize,
    pub max_settlement_lag_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
struct DueRoundView {
    round_id: String,
    end_ts: i64,
    lag_ms: i64,
}

#[derive(Debug, Serialize)]
struct OpsHealthBody {
    #[serde(flatten)]
    status: StatusBody,
    due_rounds: Vec<DueRoundView>,
}

async fn build_status(state: &AppState) -> Result<(StatusBody, Vec<DueRoundView>), ApiError> {
    let now = Utc::now().timestamp();
    let due = state
        .ledger
        .rounds_due(now, state.config.ops_scan_limit)
        .await
        .map_err(ApiError::from)?;

    let detail: Vec<DueRoundView> = due
        .iter()
        .map(|d| DueRoundView {
            round_id: d.key.id_string(),
            end_ts: d.end_ts,
            lag_ms: (now - d.end_ts).max(0) * 1000,
        })
        .collect();
    let max_lag_ms = detail.iter().map(|d| d.lag_ms).max().unwrap_or(0);

    let joins_paused = state.config.pause.joins;
    let settlement_paused = state
        .config
        .pause
        .settlement_paused(state.config.custody_mode);
    let status = if joins_paused || settlement_paused {
        "paused"
    } else if max_lag_ms > DEGRADED_LAG_MS {
        "degraded"
    } else {
        "ok"
    };

    state.metrics.set_pending_due(detail.len() as i64, max_lag_ms);
    Ok((
        StatusBody {
            ok: status == "ok",
            status: status.to_string(),
            joins_paused,
            settlement_paused,
            pending_due_rounds: detail.len(),
            max_settlement_lag_ms: max_lag_ms,
            updated_at_ms: Utc::now().timestamp_millis(),
        },
        detail,
    ))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let cache_key = keys::api_status();
    if let Ok(Some(cached)) = state.cache.get_json::<StatusBody>(&cache_key).await {
        return Ok((StatusCode::OK, Json(cached)));
    }

    let (body, _) = build_status(&state).await?;
    let ttl = Duration::from_millis(state.config.status_cache_ms.max(1000));
    if let Err(err) = state.cache.set_json(&cache_key, &body, ttl).await {
        tracing::debug!("status cache write skipped: {err}");
    }
    Ok((StatusCode::OK, Json(body)))
}

pub async fn ops_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let provided = headers
        .get("x-ops-key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, &state.config.ops_key) {
        return Err(EngineError::Auth.into());
    }

    let (status, due_rounds) = build_status(&state).await?;
    Ok((StatusCode::OK, Json(OpsHealthBody { status, due_rounds })))
}
