use std::time::Instant;

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use serde::Deserialize;
use tracing::Instrument;
use transit_contracts::{LineStatus, StatusRecord};

use super::{
    ApiError, AppState, bounded_limit, extract_request_id, invalid_params,
    ledger_error_response, not_found, observe_result, parse_query, to_view,
};
use crate::view_cache::ViewKey;

const STATUS_HISTORY_DEFAULT: i64 = 20;
const STATUS_HISTORY_MAX: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct LinesQuery {
    #[serde(default)]
    status: Option<String>,
}

pub(super) async fn list_lines(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<LinesQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "lines.list",
        request_id = %request_id,
        status_filter = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let query = parse_query(query)?;
        let filter = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(raw) => Some(LineStatus::parse(raw).ok_or_else(|| {
                invalid_params("status must be one of normal, delayed, stopped")
            })?),
        };
        if let Some(filter) = filter {
            tracing::Span::current().record("status_filter", filter.as_str());
        }

        let key = ViewKey::LineList(filter);
        if let Some(cached) = state.views.get(&key).await {
            tracing::Span::current().record("outcome", "cache_hit");
            return Ok(Json(cached));
        }

        let lines = state
            .ledger
            .list_lines(filter)
            .await
            .map_err(|err| ledger_error_response(&err))?;
        let view = to_view(&lines)?;
        state.views.put(key, view.clone()).await;

        tracing::Span::current().record("outcome", "ok");
        Ok(Json(view))
    }
    .instrument(span)
    .await;

    observe_result("/v1/lines", "GET", StatusCode::OK, &result, started);
    result
}

pub(super) async fn line_detail(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "lines.detail",
        request_id = %request_id,
        line_code = %code,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let key = ViewKey::LineDetail(code.clone());
        if let Some(cached) = state.views.get(&key).await {
            tracing::Span::current().record("outcome", "cache_hit");
            return Ok(Json(cached));
        }

        let detail = state
            .ledger
            .line_detail(&code, Utc::now())
            .await
            .map_err(|err| ledger_error_response(&err))?
            .ok_or_else(|| not_found("line"))?;
        let view = to_view(&detail)?;
        state.views.put(key, view.clone()).await;

        tracing::Span::current().record("outcome", "ok");
        Ok(Json(view))
    }
    .instrument(span)
    .await;

    observe_result("/v1/lines/{code}", "GET", StatusCode::OK, &result, started);
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct HistoryQuery {
    #[serde(default)]
    limit: Option<i64>,
}

pub(super) async fn status_history(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<StatusRecord>>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "lines.status_history",
        request_id = %request_id,
        line_code = %code,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let query = parse_query(query)?;
        let limit = bounded_limit(query.limit, STATUS_HISTORY_DEFAULT, STATUS_HISTORY_MAX)?;

        let line = state
            .ledger
            .line_by_code(&code)
            .await
            .map_err(|err| ledger_error_response(&err))?
            .ok_or_else(|| not_found("line"))?;
        let history = state
            .ledger
            .status_history(line.id, limit)
            .await
            .map_err(|err| ledger_error_response(&err))?;

        tracing::Span::current().record("outcome", "ok");
        Ok(Json(history))
    }
    .instrument(span)
    .await;

    observe_result(
        "/v1/lines/{code}/status-history",
        "GET",
        StatusCode::OK,
        &result,
        started,
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StationsQuery {
    line_id: i64,
}

pub(super) async fn stations(
    State(state): State<AppState>,
    query: Result<Query<StationsQuery>, QueryRejection>,
) -> Result<Json<Vec<transit_contracts::Station>>, ApiError> {
    let started = Instant::now();

    let result = async {
        let query = parse_query(query)?;
        state
            .ledger
            .line_by_id(query.line_id)
            .await
            .map_err(|err| ledger_error_response(&err))?
            .ok_or_else(|| not_found("line"))?;
        let stations = state
            .ledger
            .stations_for_line(query.line_id)
            .await
            .map_err(|err| ledger_error_response(&err))?;
        Ok(Json(stations))
    }
    .await;

    observe_result("/v1/stations", "GET", StatusCode::OK, &result, started);
    result
}
