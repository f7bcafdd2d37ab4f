use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use transit_contracts::{IssueReport, ReportListing};
use transit_policy::ValidatedReport;

use crate::{LedgerError, TransitLedger, decode_issue_type, decode_status};

pub(crate) const REPORT_LISTING_SELECT: &str = "SELECT ir.id, ir.line_id, ir.station_id, ir.issue_type, ir.description, ir.status, ir.reported_at, \
     ml.code AS line_code, ml.name AS line_name, st.name AS station_name \
     FROM issue_reports ir \
     JOIN metro_lines ml ON ml.id = ir.line_id \
     LEFT JOIN stations st ON st.id = ir.station_id";

impl TransitLedger {
    /// Persists a validated report. The station, when given, must belong to
    /// the report's line.
    pub async fn insert_report(
        &self,
        report: &ValidatedReport,
        now: DateTime<Utc>,
    ) -> Result<IssueReport, LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;

            let line_exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM metro_lines WHERE id = $1)")
                    .bind(report.line_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !line_exists {
                return Err(LedgerError::NotFound("line"));
            }

            if let Some(station_id) = report.station_id {
                let station_line: Option<i64> =
                    sqlx::query_scalar("SELECT line_id FROM stations WHERE id = $1")
                        .bind(station_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if station_line != Some(report.line_id) {
                    return Err(LedgerError::NotFound("station on line"));
                }
            }

            let row = sqlx::query(
                "INSERT INTO issue_reports (line_id, station_id, issue_type, description, status, reported_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 RETURNING id, line_id, station_id, issue_type, description, status, reported_at",
            )
            .bind(report.line_id)
            .bind(report.station_id)
            .bind(report.issue_type.as_str())
            .bind(report.description.as_deref())
            .bind(report.status.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            let created = report_from_row(&row)?;

            tx.commit().await?;
            Ok(created)
        })
        .await
    }

    /// Deletes a report and returns it joined with its line, so callers know
    /// which views went stale.
    pub async fn delete_report(&self, report_id: i64) -> Result<ReportListing, LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(&format!("{REPORT_LISTING_SELECT} WHERE ir.id = $1"))
                .bind(report_id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                return Err(LedgerError::NotFound("report"));
            };
            let listing = listing_from_row(&row)?;

            sqlx::query("DELETE FROM issue_reports WHERE id = $1")
                .bind(report_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(listing)
        })
        .await
    }

    /// Most recent reports across all lines, newest first.
    pub async fn recent_reports(&self, limit: i64) -> Result<Vec<ReportListing>, LedgerError> {
        self.bounded(async {
            let rows = sqlx::query(&format!(
                "{REPORT_LISTING_SELECT} ORDER BY ir.reported_at DESC, ir.id DESC LIMIT $1"
            ))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(listing_from_row).collect()
        })
        .await
    }
}

fn report_from_row(row: &PgRow) -> Result<IssueReport, sqlx::Error> {
    let issue_type: String = row.try_get("issue_type")?;
    let status: String = row.try_get("status")?;
    Ok(IssueReport {
        id: row.try_get("id")?,
        line_id: row.try_get("line_id")?,
        station_id: row.try_get("station_id")?,
        issue_type: decode_issue_type(&issue_type)?,
        description: row.try_get("description")?,
        status: decode_status(&status)?,
        reported_at: row.try_get("reported_at")?,
    })
}

pub(crate) fn listing_from_row(row: &PgRow) -> Result<ReportListing, sqlx::Error> {
    Ok(ReportListing {
        report: report_from_row(row)?,
        line_code: row.try_get("line_code")?,
        line_name: row.try_get("line_name")?,
        station_name: row.try_get("station_name")?,
    })
}
