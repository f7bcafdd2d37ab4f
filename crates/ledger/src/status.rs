use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use transit_contracts::{LineStatus, StatusRecord};
use transit_policy::{LineState, evaluate_transition, window_start};

use crate::{LedgerError, TransitLedger, decode_status};

const STATUS_COLUMNS: &str = "id, line_id, status, message, started_at, ended_at, is_current";

impl TransitLedger {
    pub async fn current_status(&self, line_id: i64) -> Result<Option<StatusRecord>, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT {STATUS_COLUMNS} FROM line_statuses WHERE line_id = $1 AND is_current"
            ))
            .bind(line_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(status_from_row).transpose()
        })
        .await
    }

    /// Status records of a line, newest first.
    pub async fn status_history(
        &self,
        line_id: i64,
        limit: i64,
    ) -> Result<Vec<StatusRecord>, LedgerError> {
        self.bounded(async {
            let rows = sqlx::query(&format!(
                "SELECT {STATUS_COLUMNS} FROM line_statuses WHERE line_id = $1 ORDER BY started_at DESC, id DESC LIMIT $2"
            ))
            .bind(line_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(status_from_row).collect()
        })
        .await
    }

    /// Re-runs the automatic transition rules for a line after a report with
    /// `submitted` status was recorded. Returns the newly opened record, if any.
    pub async fn reevaluate_status(
        &self,
        line_id: i64,
        submitted: LineStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusRecord>, LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            lock_line(&mut tx, line_id).await?;

            let recent_reports: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM issue_reports WHERE line_id = $1 AND reported_at >= $2",
            )
            .bind(line_id)
            .bind(window_start(now))
            .fetch_one(&mut *tx)
            .await?;

            let current = current_status_in_tx(&mut tx, line_id).await?;
            let state = LineState::from_current(current);

            let Some(next) = evaluate_transition(recent_reports, submitted, state) else {
                tx.commit().await?;
                return Ok::<_, sqlx::Error>(None);
            };

            let record = open_status_record(&mut tx, line_id, next, None, now).await?;
            tx.commit().await?;

            tracing::info!(
                line_id,
                recent_reports,
                from = state.status().map(LineStatus::as_str).unwrap_or("unknown"),
                to = next.as_str(),
                "line status transitioned automatically"
            );
            Ok(Some(record))
        })
        .await
    }

    /// Manual override: closes the current record and opens one with the given
    /// status, regardless of report volume.
    pub async fn force_status(
        &self,
        line_id: i64,
        status: LineStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StatusRecord, LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            lock_line(&mut tx, line_id).await?;

            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM metro_lines WHERE id = $1)")
                    .bind(line_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                return Err(LedgerError::NotFound("line"));
            }

            let record = open_status_record(&mut tx, line_id, status, message, now).await?;
            tx.commit().await?;
            Ok(record)
        })
        .await
    }
}

/// Serializes status changes per line for the lifetime of the transaction.
pub(crate) async fn lock_line(
    tx: &mut Transaction<'_, Postgres>,
    line_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('line_status:' || $1::text, 0))")
        .bind(line_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn current_status_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    line_id: i64,
) -> Result<Option<LineStatus>, sqlx::Error> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT status FROM line_statuses WHERE line_id = $1 AND is_current")
            .bind(line_id)
            .fetch_optional(&mut **tx)
            .await?;
    raw.as_deref().map(decode_status).transpose()
}

/// Closes whatever record is current for the line and opens a new current one.
/// Callers must hold the line lock.
pub(crate) async fn open_status_record(
    tx: &mut Transaction<'_, Postgres>,
    line_id: i64,
    status: LineStatus,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StatusRecord, sqlx::Error> {
    sqlx::query(
        "UPDATE line_statuses SET is_current = FALSE, ended_at = $2 WHERE line_id = $1 AND is_current",
    )
    .bind(line_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(&format!(
        "INSERT INTO line_statuses (line_id, status, message, started_at, is_current) VALUES ($1, $2, $3, $4, TRUE) RETURNING {STATUS_COLUMNS}"
    ))
    .bind(line_id)
    .bind(status.as_str())
    .bind(message)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    status_from_row(&row)
}

pub(crate) fn status_from_row(row: &PgRow) -> Result<StatusRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(StatusRecord {
        id: row.try_get("id")?,
        line_id: row.try_get("line_id")?,
        status: decode_status(&status)?,
        message: row.try_get("message")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        is_current: row.try_get("is_current")?,
    })
}
