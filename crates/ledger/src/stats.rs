use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgPool, Row};
use transit_contracts::{
    DailyIssueCount, HourlyIssueCount, LineIssueCount, Statistics, StatsWindow, TypeIssueCount,
};

use crate::{LedgerError, TransitLedger};

impl TransitLedger {
    /// Report counts by line and by type over `window`, and the per-day
    /// trend over `trend_window`. Both windows end at `now`.
    pub async fn statistics(
        &self,
        window: StatsWindow,
        trend_window: StatsWindow,
        now: DateTime<Utc>,
    ) -> Result<Statistics, LedgerError> {
        let since = window_start(window, now);
        let trend_since = window_start(trend_window, now);

        self.bounded(async {
            let issues_by_line = sqlx::query(
                "SELECT ml.id AS line_id, ml.name, ml.color, COUNT(*) AS value \
                 FROM issue_reports ir \
                 JOIN metro_lines ml ON ir.line_id = ml.id \
                 WHERE ir.reported_at >= $1 \
                 GROUP BY ml.id, ml.name, ml.color \
                 ORDER BY value DESC, ml.id ASC",
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok(LineIssueCount {
                    line_id: row.try_get("line_id")?,
                    name: row.try_get("name")?,
                    color: row.try_get("color")?,
                    value: row.try_get("value")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

            let issues_by_type = sqlx::query(
                "SELECT issue_type AS name, COUNT(*) AS value \
                 FROM issue_reports \
                 WHERE reported_at >= $1 \
                 GROUP BY issue_type \
                 ORDER BY value DESC, issue_type ASC",
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok(TypeIssueCount {
                    name: row.try_get("name")?,
                    value: row.try_get("value")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

            let daily_trend = sqlx::query(
                "SELECT date_trunc('day', reported_at, 'UTC') AS day, COUNT(*) AS issues \
                 FROM issue_reports \
                 WHERE reported_at >= $1 \
                 GROUP BY 1 \
                 ORDER BY 1 ASC",
            )
            .bind(trend_since)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                let day: DateTime<Utc> = row.try_get("day")?;
                Ok(DailyIssueCount {
                    day,
                    label: day.format("%a").to_string(),
                    issues: row.try_get("issues")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

            Ok::<_, sqlx::Error>(Statistics {
                window,
                trend_window,
                issues_by_line,
                issues_by_type,
                daily_trend,
            })
        })
        .await
    }
}

fn window_start(window: StatsWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::from_std(window.duration()).unwrap_or_else(|_| TimeDelta::days(30))
}

pub(crate) async fn hourly_history(
    pool: &PgPool,
    line_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<HourlyIssueCount>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT date_trunc('hour', reported_at, 'UTC') AS hour, COUNT(*) AS issues \
         FROM issue_reports \
         WHERE line_id = $1 AND reported_at >= $2 \
         GROUP BY 1 \
         ORDER BY 1 ASC",
    )
    .bind(line_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(HourlyIssueCount {
                hour: row.try_get("hour")?,
                issues: row.try_get("issues")?,
            })
        })
        .collect()
}
