//! HTTP server for the points core (Axum)
//!
//! Thin glue: handlers validate auth headers, convert wire DTOs, call the
//! core components, and map errors onto the status taxonomy. No business
//! rules live here.

use super::auth::{
    require_key, require_key_if_configured, API_KEY_HEADER, CRON_KEY_HEADER, NODE_KEY_HEADER,
    VERIFIER_KEY_HEADER,
};
use super::types::*;
use crate::error::Error;
use crate::heartbeat::{HeartbeatRequest, RegisterRequest};
use crate::storage::models::RollupGranularity;
use crate::CoreContext;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<CoreContext>,
}

pub fn router(ctx: Arc<CoreContext>) -> Router {
    let state = AppState { ctx };
    Router::new()
        .route("/health", get(health))
        .route("/heartbeat", post(heartbeat))
        .route("/register", post(register))
        .route("/earn", post(earn))
        .route("/convert", post(convert))
        .route("/balance/:account_id", get(balance))
        .route("/rollup/hour", post(rollup_hour))
        .route("/rollup/day", post(rollup_day))
        .route("/verifier/test", post(verifier_test))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve in the background.
pub async fn start_http(ctx: Arc<CoreContext>, addr: SocketAddr) -> crate::error::Result<()> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    log::info!("bandpoints HTTP listening on {}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("bandpoints HTTP failed: {}", e);
        }
    });
    Ok(())
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_)
        | Error::InvalidTimestamp(_)
        | Error::InvalidPublicKey(_)
        | Error::InvalidSignature(_)
        | Error::Serialization(_)
        | Error::InsufficientPoints { .. } => StatusCode::BAD_REQUEST,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::ConversionDisabled => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::RateLimited(_) | Error::DailyCapReached { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {}", self);
        }
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatResponse>, Error> {
    require_key_if_configured(&headers, NODE_KEY_HEADER, &state.ctx.config.auth.node_key)?;

    let outcome = state
        .ctx
        .heartbeat
        .handle(
            HeartbeatRequest {
                public_key: body.public_key,
                timestamp: body.timestamp,
                nonce: body.nonce,
                latency_ms: body.latency_ms,
                signature: body.signature,
            },
            chrono::Utc::now().timestamp(),
        )
        .await?;

    Ok(Json(HeartbeatResponse {
        signature_ok: outcome.signature_ok,
        awarded: outcome.awarded,
    }))
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Result<Json<RegisterResponse>, Error> {
    require_key_if_configured(&headers, NODE_KEY_HEADER, &state.ctx.config.auth.node_key)?;

    let device = state
        .ctx
        .heartbeat
        .register(
            RegisterRequest {
                public_key: body.public_key,
                fingerprint: body.fingerprint,
                region: body.region,
                asn: body.asn,
                timestamp: body.timestamp,
                nonce: body.nonce,
                signature: body.signature,
            },
            chrono::Utc::now().timestamp(),
        )
        .await?;

    Ok(Json(RegisterResponse {
        device: device.into(),
        signature_ok: true,
    }))
}

async fn earn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EarnBody>,
) -> Result<Json<EarnResponse>, Error> {
    require_key(&headers, API_KEY_HEADER, &state.ctx.config.auth.api_key)?;

    let now = chrono::Utc::now().timestamp();
    // Client nonces pin retries of the same submission to one credit;
    // without one each call is a distinct event.
    let dedupe_key = match &body.nonce {
        Some(nonce) => format!("{}:{}:{}", body.account_id, body.earn_type.as_str(), nonce),
        None => format!("{}:{}:{}", body.account_id, body.earn_type.as_str(), Uuid::new_v4()),
    };

    let outcome = state
        .ctx
        .ledger
        .award(crate::ledger::AwardRequest {
            account_id: body.account_id.clone(),
            device_id: None,
            earn_type: body.earn_type,
            amount: body.amount,
            source: "api".to_string(),
            rule_version: state.ctx.config.reward.rule_version,
            dedupe_key,
            occurred_at: now,
            meta: body.meta,
        })
        .await?;

    let daily = state.ctx.ledger.daily_usage(&body.account_id, now).await?;

    Ok(Json(EarnResponse {
        credited: outcome.credited,
        duplicate: outcome.duplicate,
        daily,
        balance: outcome.balance.into(),
    }))
}

async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConvertBody>,
) -> Result<Json<ConvertResponse>, Error> {
    require_key(&headers, API_KEY_HEADER, &state.ctx.config.auth.api_key)?;

    let receipt = state
        .ctx
        .conversion
        .convert(&body.account_id, body.points, chrono::Utc::now().timestamp())
        .await?;

    Ok(Json(ConvertResponse {
        points_spent: receipt.points_spent,
        token_received: receipt.token_received,
        rate: receipt.rate,
        balance: receipt.balance.into(),
    }))
}

async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<BalanceInfo>, Error> {
    require_key(&headers, API_KEY_HEADER, &state.ctx.config.auth.api_key)?;

    if !state.ctx.ledger.account_exists(&account_id).await? {
        return Err(Error::NotFound(format!("account {}", account_id)));
    }
    let balance = state.ctx.ledger.get_balance(&account_id).await?;
    Ok(Json(balance.into()))
}

async fn rollup_hour(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RollupBody>>,
) -> Result<Json<RollupResponse>, Error> {
    run_rollup(state, headers, body, RollupGranularity::Hour).await
}

async fn rollup_day(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RollupBody>>,
) -> Result<Json<RollupResponse>, Error> {
    run_rollup(state, headers, body, RollupGranularity::Day).await
}

async fn run_rollup(
    state: AppState,
    headers: HeaderMap,
    body: Option<Json<RollupBody>>,
    granularity: RollupGranularity,
) -> Result<Json<RollupResponse>, Error> {
    require_key(&headers, CRON_KEY_HEADER, &state.ctx.config.auth.cron_key)?;

    let now = chrono::Utc::now().timestamp();
    // Default target is the most recently closed window.
    let window_start = body
        .and_then(|Json(body)| body.window_start)
        .unwrap_or_else(|| granularity.window_start(now) - granularity.window_secs());

    let report = state.ctx.aggregator.run(granularity, window_start, now).await?;
    let rewards_credited = match granularity {
        RollupGranularity::Hour => {
            state
                .ctx
                .aggregator
                .distribute_rewards(report.window_start)
                .await?
        }
        RollupGranularity::Day => 0,
    };

    Ok(Json(RollupResponse {
        window: WindowInfo {
            granularity,
            start: report.window_start,
            end: report.window_start + granularity.window_secs(),
        },
        accounts_processed: report.accounts_processed,
        rewards_credited,
    }))
}

async fn verifier_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProbeBody>,
) -> Result<Json<ProbeResponse>, Error> {
    require_key(&headers, VERIFIER_KEY_HEADER, &state.ctx.config.auth.verifier_key)?;

    let started_at = body
        .started_at
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let probe = state
        .ctx
        .aggregator
        .record_probe(
            &body.device_id,
            body.download_mbps,
            body.upload_mbps,
            body.latency_ms,
            body.success,
            started_at,
        )
        .await?;

    Ok(Json(ProbeResponse {
        probe: probe.into(),
    }))
}
