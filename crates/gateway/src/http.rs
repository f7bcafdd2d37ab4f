use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use transit_ledger::{LedgerError, TransitLedger};
use ulid::Ulid;

use crate::config::{GatewayConfig, IntakeBackend, StartupError};
use crate::rate_limit::{IntakeGuard, MemoryIntake};
use crate::view_cache::ViewCache;

mod admin;
mod lines;
mod reports;
mod statistics;

const ADMIN_SECRET_HEADER: &str = "x-transit-admin-secret";
const REQUEST_ID_HEADER: &str = "x-transit-request-id";
const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    ledger: TransitLedger,
    intake: IntakeGuard,
    views: ViewCache,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl AppState {
    pub fn new(config: GatewayConfig, ledger: TransitLedger) -> Self {
        let intake = match config.intake_backend {
            IntakeBackend::Database => IntakeGuard::Database(ledger.clone()),
            IntakeBackend::Memory => IntakeGuard::Memory(MemoryIntake::new(config.intake_max_keys)),
        };
        let views = ViewCache::new(
            config.view_cache_max_entries,
            Duration::from_millis(config.view_cache_ttl_ms),
        );

        Self {
            config,
            ledger,
            intake,
            views,
        }
    }
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let ledger = TransitLedger::connect_and_migrate(
        &config.db_url,
        config.db_max_connections,
        Duration::from_millis(config.db_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to initialize ledger: {}", err),
    })?;

    match ledger.prune_submissions(Utc::now()).await {
        Ok(pruned) => tracing::info!(pruned, "expired report submissions pruned"),
        Err(err) => tracing::warn!(error = %err, "failed to prune report submissions"),
    }

    let state = AppState::new(config, ledger);
    tracing::info!(
        intake_backend = state.intake.backend_name(),
        view_cache_enabled = state.views.enabled(),
        admin_enabled = state.config.admin_secret.is_some(),
        "transit gateway initialized"
    );

    Ok(app(state))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/lines", get(lines::list_lines))
        .route("/v1/lines/{code}", get(lines::line_detail))
        .route("/v1/lines/{code}/status-history", get(lines::status_history))
        .route("/v1/stations", get(lines::stations))
        .route("/v1/reports", post(reports::submit_report))
        .route("/v1/reports/recent", get(reports::recent_reports))
        .route("/v1/statistics", get(statistics::statistics))
        .route("/v1/admin/lines", post(admin::create_line))
        .route("/v1/admin/lines/{line_id}", patch(admin::update_line))
        .route("/v1/admin/lines/{line_id}/status", post(admin::override_status))
        .route("/v1/admin/stations", post(admin::create_station))
        .route("/v1/admin/stations/{station_id}", patch(admin::update_station))
        .route("/v1/admin/reports/{report_id}", delete(admin::delete_report))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("database", state.ledger.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_admin
        && let Err(err) = require_admin(&state, &headers)
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Records the request in the HTTP metrics. `ok_status` is what the handler
/// answers on success.
fn observe_result<T>(
    route: &str,
    method: &str,
    ok_status: StatusCode,
    result: &Result<T, ApiError>,
    started: Instant,
) {
    let status = match result {
        Ok(_) => ok_status,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    validate_admin_secret(headers, state.config.admin_secret.as_deref())
}

fn validate_admin_secret(headers: &HeaderMap, expected_secret: Option<&str>) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "ERR_ADMIN_DISABLED",
            "admin operations are disabled on this gateway",
            false,
        ));
    };

    let provided_secret = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing admin secret",
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid admin secret",
            false,
        ));
    }

    Ok(())
}

/// Network identity used for intake limiting: the raw `x-forwarded-for`
/// value, or one shared bucket for callers without one.
fn client_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn parse_json<T>(req: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    req.map(|Json(body)| body).map_err(|rejection| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            format!("invalid JSON body: {}", rejection.body_text()),
            false,
        )
    })
}

fn parse_query<T>(query: Result<axum::extract::Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|axum::extract::Query(params)| params)
        .map_err(|rejection| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                format!("invalid query string: {}", rejection.body_text()),
                false,
            )
        })
}

/// Resolves an optional `limit` parameter against a default and an upper bound.
fn bounded_limit(raw: Option<i64>, default: i64, max: i64) -> Result<i64, ApiError> {
    match raw {
        None => Ok(default.min(max)),
        Some(limit) if limit >= 1 => Ok(limit.min(max)),
        Some(_) => Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "limit must be >= 1",
            false,
        )),
    }
}

/// Serializes a view into the JSON value the cache stores.
fn to_view<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|err| {
        tracing::error!(error = %err, "failed to serialize view");
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "failed to serialize response",
            false,
        )
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            detail: None,
        }),
    )
}

fn ledger_error_response(err: &LedgerError) -> ApiError {
    match err {
        LedgerError::Timeout => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_SOURCE_TIMEOUT",
            "database timeout",
            true,
        ),
        LedgerError::NotFound(what) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND",
            format!("{} not found", what),
            false,
        ),
        LedgerError::Conflict(what) => {
            json_error(StatusCode::CONFLICT, "ERR_CONFLICT", what.to_string(), false)
        }
        LedgerError::Sqlx(inner) => {
            tracing::error!(error = %inner, "database error");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_DB_UNAVAILABLE",
                "database unavailable",
                true,
            )
        }
    }
}

fn not_found(what: &str) -> ApiError {
    json_error(
        StatusCode::NOT_FOUND,
        "ERR_NOT_FOUND",
        format!("{} not found", what),
        false,
    )
}

fn invalid_params(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", message, false)
}
