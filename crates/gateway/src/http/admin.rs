use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;
use transit_contracts::{
    MetroLine, MetroLinePatch, NewMetroLine, NewStation, ReportListing, Station, StationPatch,
    StatusOverride, StatusRecord,
};
use transit_policy::{
    TransitionTrigger, validate_line_patch, validate_new_line, validate_new_station,
    validate_station_patch, validate_status_override,
};

use super::reports::invalidate_line_views;
use super::{
    ApiError, AppState, extract_request_id, invalid_params, ledger_error_response,
    observe_result, parse_json, require_admin,
};

#[derive(Debug, Serialize)]
pub(super) struct CreatedLine {
    line: MetroLine,
    status: StatusRecord,
}

pub(super) async fn create_line(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NewMetroLine>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedLine>), ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "admin.create_line",
        request_id = %request_id,
        line_id = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let req = parse_json(req)?;
        let line = validate_new_line(&req).map_err(|err| invalid_params(err.to_string()))?;

        let (line, status) = state
            .ledger
            .create_line(&line, Utc::now())
            .await
            .map_err(|err| ledger_error_response(&err))?;
        tracing::Span::current().record("line_id", line.id);

        state.views.invalidate_line(Some(&line.code)).await;
        tracing::Span::current().record("outcome", "ok");
        tracing::info!(line_id = line.id, code = %line.code, "metro line created");

        Ok((StatusCode::CREATED, Json(CreatedLine { line, status })))
    }
    .instrument(span)
    .await;

    observe_result("/v1/admin/lines", "POST", StatusCode::CREATED, &result, started);
    result
}

pub(super) async fn update_line(
    State(state): State<AppState>,
    Path(line_id): Path<i64>,
    headers: HeaderMap,
    req: Result<Json<MetroLinePatch>, JsonRejection>,
) -> Result<Json<MetroLine>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let req = parse_json(req)?;
        let patch = validate_line_patch(&req).map_err(|err| invalid_params(err.to_string()))?;

        let line = state
            .ledger
            .update_line(line_id, &patch)
            .await
            .map_err(|err| ledger_error_response(&err))?;

        state.views.invalidate_line(Some(&line.code)).await;
        tracing::info!(line_id, "metro line updated");
        Ok(Json(line))
    }
    .await;

    observe_result("/v1/admin/lines/{line_id}", "PATCH", StatusCode::OK, &result, started);
    result
}

pub(super) async fn override_status(
    State(state): State<AppState>,
    Path(line_id): Path<i64>,
    headers: HeaderMap,
    req: Result<Json<StatusOverride>, JsonRejection>,
) -> Result<(StatusCode, Json<StatusRecord>), ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "admin.override_status",
        request_id = %request_id,
        line_id,
        status = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let req = parse_json(req)?;
        let update =
            validate_status_override(&req).map_err(|err| invalid_params(err.to_string()))?;
        tracing::Span::current().record("status", update.status.as_str());

        let record = state
            .ledger
            .force_status(line_id, update.status, update.message.as_deref(), Utc::now())
            .await
            .map_err(|err| ledger_error_response(&err))?;

        crate::metrics::observe_status_transition(
            TransitionTrigger::Manual.as_str(),
            record.status.as_str(),
        );
        invalidate_line_views(&state, line_id).await;

        tracing::Span::current().record("outcome", "ok");
        tracing::info!(
            line_id,
            status = record.status.as_str(),
            "line status set manually"
        );
        Ok((StatusCode::CREATED, Json(record)))
    }
    .instrument(span)
    .await;

    observe_result(
        "/v1/admin/lines/{line_id}/status",
        "POST",
        StatusCode::CREATED,
        &result,
        started,
    );
    result
}

pub(super) async fn create_station(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NewStation>, JsonRejection>,
) -> Result<(StatusCode, Json<Station>), ApiError> {
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let req = parse_json(req)?;
        let station =
            validate_new_station(&req).map_err(|err| invalid_params(err.to_string()))?;

        let station = state
            .ledger
            .create_station(&station)
            .await
            .map_err(|err| ledger_error_response(&err))?;

        invalidate_line_views(&state, station.line_id).await;
        tracing::info!(
            station_id = station.id,
            line_id = station.line_id,
            "station created"
        );
        Ok((StatusCode::CREATED, Json(station)))
    }
    .await;

    observe_result("/v1/admin/stations", "POST", StatusCode::CREATED, &result, started);
    result
}

pub(super) async fn update_station(
    State(state): State<AppState>,
    Path(station_id): Path<i64>,
    headers: HeaderMap,
    req: Result<Json<StationPatch>, JsonRejection>,
) -> Result<Json<Station>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let req = parse_json(req)?;
        let patch =
            validate_station_patch(&req).map_err(|err| invalid_params(err.to_string()))?;

        let (station, line_code) = state
            .ledger
            .update_station(station_id, &patch)
            .await
            .map_err(|err| ledger_error_response(&err))?;

        state.views.invalidate_line(Some(&line_code)).await;
        tracing::info!(station_id, "station updated");
        Ok(Json(station))
    }
    .await;

    observe_result(
        "/v1/admin/stations/{station_id}",
        "PATCH",
        StatusCode::OK,
        &result,
        started,
    );
    result
}

pub(super) async fn delete_report(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ReportListing>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;

        let deleted = state
            .ledger
            .delete_report(report_id)
            .await
            .map_err(|err| ledger_error_response(&err))?;

        state.views.invalidate_line(Some(&deleted.line_code)).await;
        tracing::info!(report_id, line_code = %deleted.line_code, "report deleted");
        Ok(Json(deleted))
    }
    .await;

    observe_result(
        "/v1/admin/reports/{report_id}",
        "DELETE",
        StatusCode::OK,
        &result,
        started,
    );
    result
}
