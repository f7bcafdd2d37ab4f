use std::time::Instant;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use transit_contracts::{
    IntakeDecision, IssueReport, NewIssueReport, ReportListing, StatusRecord,
};
use transit_policy::{TransitionTrigger, denial_message, validate_report};

use super::{
    ApiError, AppState, ErrorResponse, bounded_limit, client_identity, extract_request_id,
    invalid_params, json_error, ledger_error_response, observe_result, parse_json, parse_query,
    require_admin,
};

const RECENT_REPORTS_DEFAULT: i64 = 10;

#[derive(Debug, Serialize)]
pub(super) struct SubmitReportResponse {
    report: IssueReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_change: Option<StatusRecord>,
}

pub(super) async fn submit_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NewIssueReport>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReportResponse>), ApiError> {
    let request_id = extract_request_id(&headers);
    let identity = client_identity(&headers);
    let span = tracing::info_span!(
        "reports.submit",
        request_id = %request_id,
        identity = %identity,
        line_id = tracing::field::Empty,
        report_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let now = Utc::now();

        let decision = state.intake.check(&identity, now).await.map_err(|err| {
            crate::metrics::observe_report("error");
            ledger_error_response(&err)
        })?;
        if let IntakeDecision::Denied { count } = decision {
            crate::metrics::observe_report("rate_limited");
            tracing::Span::current().record("outcome", "rate_limited");
            return Err(rate_limited(count));
        }

        let req = parse_json(req).inspect_err(|_| crate::metrics::observe_report("invalid"))?;
        let report = validate_report(&req).map_err(|err| {
            crate::metrics::observe_report("invalid");
            invalid_params(err.to_string())
        })?;
        tracing::Span::current().record("line_id", report.line_id);

        let stored = state.ledger.insert_report(&report, now).await.map_err(|err| {
            crate::metrics::observe_report(match &err {
                transit_ledger::LedgerError::NotFound(_) => "invalid",
                _ => "error",
            });
            ledger_error_response(&err)
        })?;
        tracing::Span::current().record("report_id", stored.id);
        crate::metrics::observe_report("accepted");

        match state.intake.record(&identity, now).await {
            Ok(submission) => tracing::debug!(
                submitted_at = %submission.submitted_at,
                "report submission recorded"
            ),
            Err(err) => tracing::warn!(error = %err, "failed to record report submission"),
        }

        let status_change = match state
            .ledger
            .reevaluate_status(stored.line_id, stored.status, now)
            .await
        {
            Ok(change) => change,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    line_id = stored.line_id,
                    "status re-evaluation failed; report kept"
                );
                None
            }
        };
        if let Some(record) = &status_change {
            crate::metrics::observe_status_transition(
                TransitionTrigger::Automatic.as_str(),
                record.status.as_str(),
            );
        }

        invalidate_line_views(&state, stored.line_id).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", "accepted");
        tracing::info!(
            report_id = stored.id,
            line_id = stored.line_id,
            issue_type = stored.issue_type.as_str(),
            status_changed = status_change.is_some(),
            "report accepted"
        );

        Ok((
            StatusCode::CREATED,
            Json(SubmitReportResponse {
                report: stored,
                status_change,
            }),
        ))
    }
    .instrument(span)
    .await;

    observe_result("/v1/reports", "POST", StatusCode::CREATED, &result, started);
    result
}

fn rate_limited(count: u32) -> ApiError {
    let (status, Json(body)) = json_error(
        StatusCode::TOO_MANY_REQUESTS,
        "ERR_RATE_LIMITED",
        denial_message(count),
        true,
    );
    (
        status,
        Json(ErrorResponse {
            detail: Some(serde_json::json!({ "count": count })),
            ..body
        }),
    )
}

/// Drops the cached views a write on `line_id` made stale.
pub(super) async fn invalidate_line_views(state: &AppState, line_id: i64) {
    if !state.views.enabled() {
        return;
    }
    match state.ledger.line_by_id(line_id).await {
        Ok(Some(line)) => state.views.invalidate_line(Some(&line.code)).await,
        Ok(None) => state.views.invalidate_line(None).await,
        Err(err) => {
            tracing::warn!(error = %err, line_id, "failed to resolve line for view invalidation");
            state.views.invalidate_all().await;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct RecentQuery {
    #[serde(default)]
    limit: Option<i64>,
}

pub(super) async fn recent_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Json<Vec<ReportListing>>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_admin(&state, &headers)?;
        let query = parse_query(query)?;
        let limit = bounded_limit(
            query.limit,
            RECENT_REPORTS_DEFAULT,
            state.config.recent_reports_max,
        )?;

        let reports = state
            .ledger
            .recent_reports(limit)
            .await
            .map_err(|err| ledger_error_response(&err))?;
        Ok(Json(reports))
    }
    .await;

    observe_result("/v1/reports/recent", "GET", StatusCode::OK, &result, started);
    result
}
