use std::time::Instant;

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use transit_contracts::StatsWindow;

use super::{
    ApiError, AppState, invalid_params, ledger_error_response, observe_result, parse_query,
    to_view,
};
use crate::view_cache::ViewKey;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StatisticsQuery {
    #[serde(default)]
    window: Option<String>,
    #[serde(default)]
    trend: Option<String>,
}

fn parse_window(
    raw: Option<&str>,
    default: StatsWindow,
    name: &str,
) -> Result<StatsWindow, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => StatsWindow::parse(raw)
            .ok_or_else(|| invalid_params(format!("{name} must be one of 24h, 7d, 30d"))),
    }
}

pub(super) async fn statistics(
    State(state): State<AppState>,
    query: Result<Query<StatisticsQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();

    let result = async {
        let query = parse_query(query)?;
        let window = parse_window(query.window.as_deref(), StatsWindow::Month, "window")?;
        let trend = parse_window(query.trend.as_deref(), StatsWindow::Week, "trend")?;

        let key = ViewKey::Statistics(window, trend);
        if let Some(cached) = state.views.get(&key).await {
            return Ok(Json(cached));
        }

        let stats = state
            .ledger
            .statistics(window, trend, Utc::now())
            .await
            .map_err(|err| ledger_error_response(&err))?;
        let view = to_view(&stats)?;
        state.views.put(key, view.clone()).await;
        Ok(Json(view))
    }
    .await;

    observe_result("/v1/statistics", "GET", StatusCode::OK, &result, started);
    result
}
