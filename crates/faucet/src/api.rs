//! HTTP API for faucet service

use crate::auth::Caller;
use crate::engine::{FaucetStatus, LimitsView, QuotaEngine};
use crate::error::{FaucetError, FaucetResult};
use crate::ledger::TransferReceipt;
use crate::limits::AuditEvent;
use crate::policy::GlobalPolicy;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use quota_common::{AccountId, Amount, KeySet};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{error, info};

/// Rate limiter using governor crate
type RateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
    rate_limiter: Arc<RateLimiterImpl>,
    metrics_enabled: bool,
}

impl AppState {
    pub fn new(engine: Arc<QuotaEngine>, max_requests_per_minute: u32, metrics_enabled: bool) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max_requests_per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            engine,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            metrics_enabled,
        }
    }
}

/// Fund request
#[derive(Debug, Deserialize)]
pub struct RequestFundsBody {
    pub account: AccountId,
    /// Guard for the account if the ledger has to create it
    pub guard: KeySet,
    pub amount: Amount,
    #[serde(default)]
    pub caller: Caller,
}

/// Return of previously received funds
#[derive(Debug, Deserialize)]
pub struct ReturnFundsBody {
    pub account: AccountId,
    pub amount: Amount,
    #[serde(default)]
    pub caller: Caller,
}

/// Per-account limit override
#[derive(Debug, Deserialize)]
pub struct SetLimitBody {
    pub account: AccountId,
    pub limit: Amount,
    #[serde(default)]
    pub caller: Caller,
}

/// Default limit changes; absent fields are left alone
#[derive(Debug, Deserialize)]
pub struct SetDefaultsBody {
    pub request_limit: Option<Amount>,
    pub account_limit: Option<Amount>,
    #[serde(default)]
    pub caller: Caller,
}

/// Success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub data: T,
    pub timestamp: String,
}

fn success<T>(data: T) -> Json<SuccessResponse<T>> {
    Json(SuccessResponse {
        data,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

fn parse_account(raw: &str) -> FaucetResult<AccountId> {
    Ok(raw.parse::<AccountId>()?)
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/limits/:account", get(limits_handler))
        .route("/api/events/:account", get(events_handler))
        .route("/api/request", post(request_handler))
        .route("/api/return", post(return_handler))
        .route("/api/admin/request-limit", post(set_request_limit_handler))
        .route("/api/admin/account-limit", post(set_account_limit_handler))
        .route("/api/admin/defaults", post(set_defaults_handler))
        .with_state(state)
}

/// Request handler
pub async fn request_handler(
    State(state): State<AppState>,
    Json(body): Json<RequestFundsBody>,
) -> FaucetResult<Json<SuccessResponse<TransferReceipt>>> {
    info!("Fund request: account={}, amount={}", body.account, body.amount);

    state.rate_limiter.check().map_err(|not_until| {
        let wait = not_until.wait_time_from(DefaultClock::default().now());
        // Whole seconds, rounded up
        let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        FaucetError::RateLimitExceeded(retry_after.max(1))
    })?;

    let receipt = state
        .engine
        .request(&body.caller, &body.account, &body.guard, body.amount)
        .await
        .map_err(|e| {
            error!("Request error: {:?}", e);
            e
        })?;

    Ok(success(receipt))
}

/// Return handler
pub async fn return_handler(
    State(state): State<AppState>,
    Json(body): Json<ReturnFundsBody>,
) -> FaucetResult<Json<SuccessResponse<TransferReceipt>>> {
    info!("Return: account={}, amount={}", body.account, body.amount);
    let receipt = state
        .engine
        .return_funds(&body.caller, &body.account, body.amount)
        .await?;
    Ok(success(receipt))
}

pub async fn set_request_limit_handler(
    State(state): State<AppState>,
    Json(body): Json<SetLimitBody>,
) -> FaucetResult<Json<SuccessResponse<LimitsView>>> {
    state
        .engine
        .set_request_limit(&body.caller, &body.account, body.limit)
        .await?;
    Ok(success(state.engine.get_limits(&body.account)?))
}

pub async fn set_account_limit_handler(
    State(state): State<AppState>,
    Json(body): Json<SetLimitBody>,
) -> FaucetResult<Json<SuccessResponse<LimitsView>>> {
    state
        .engine
        .set_account_limit(&body.caller, &body.account, body.limit)
        .await?;
    Ok(success(state.engine.get_limits(&body.account)?))
}

pub async fn set_defaults_handler(
    State(state): State<AppState>,
    Json(body): Json<SetDefaultsBody>,
) -> FaucetResult<Json<SuccessResponse<GlobalPolicy>>> {
    let policy = state
        .engine
        .set_defaults(&body.caller, body.request_limit, body.account_limit)
        .await?;
    Ok(success(policy))
}

/// Limits handler
pub async fn limits_handler(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> FaucetResult<Json<SuccessResponse<LimitsView>>> {
    let account = parse_account(&account)?;
    Ok(success(state.engine.get_limits(&account)?))
}

pub async fn events_handler(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> FaucetResult<Json<SuccessResponse<Vec<AuditEvent>>>> {
    let account = parse_account(&account)?;
    Ok(success(state.engine.events(&account)?))
}

/// Status handler
pub async fn status_handler(
    State(state): State<AppState>,
) -> FaucetResult<Json<SuccessResponse<FaucetStatus>>> {
    let status = state.engine.status().await?;
    Ok(success(status))
}

pub async fn metrics_handler(State(state): State<AppState>) -> FaucetResult<impl IntoResponse> {
    if !state.metrics_enabled {
        return Ok((StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], String::new()));
    }
    let body = state.engine.metrics().render()?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Root handler with info
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Quota Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Quota-governed fund dispensing service",
        "endpoints": {
            "POST /api/request": "Request funds",
            "POST /api/return": "Return funds",
            "GET /api/limits/:account": "Get account limits",
            "GET /api/events/:account": "Get account history",
            "POST /api/admin/request-limit": "Set an account's per-request limit",
            "POST /api/admin/account-limit": "Set an account's cumulative limit",
            "POST /api/admin/defaults": "Set default limits",
            "GET /api/status": "Get faucet status",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
