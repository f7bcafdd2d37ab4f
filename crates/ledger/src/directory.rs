use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use transit_contracts::{
    LineDetail, LineStatus, LineSummary, MetroLine, MetroLinePatch, NewMetroLine, NewStation,
    Station, StationPatch, StatusRecord,
};

use crate::reports::{REPORT_LISTING_SELECT, listing_from_row};
use crate::stats::hourly_history;
use crate::status::{lock_line, open_status_record, status_from_row};
use crate::{LedgerError, TransitLedger, decode_status};

/// Reports shown on a line's detail view.
const DETAIL_REPORTS_HOURS: i64 = 24;
/// Hour buckets in a line's issue history.
const DETAIL_HISTORY_HOURS: i64 = 12;

impl TransitLedger {
    /// All lines ordered by id, each with its current status. A filter keeps
    /// only lines whose current status matches.
    pub async fn list_lines(
        &self,
        status: Option<LineStatus>,
    ) -> Result<Vec<LineSummary>, LedgerError> {
        self.bounded(async {
            let rows = sqlx::query(
                "SELECT ml.id, ml.name, ml.code, ml.color, ls.status, ls.message \
                 FROM metro_lines ml \
                 LEFT JOIN line_statuses ls ON ls.line_id = ml.id AND ls.is_current \
                 WHERE ($1::text IS NULL OR ls.status = $1) \
                 ORDER BY ml.id ASC",
            )
            .bind(status.map(LineStatus::as_str))
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let status: Option<String> = row.try_get("status")?;
                    Ok(LineSummary {
                        id: row.try_get("id")?,
                        name: row.try_get("name")?,
                        code: row.try_get("code")?,
                        color: row.try_get("color")?,
                        status: status.as_deref().map(decode_status).transpose()?,
                        message: row.try_get("message")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    pub async fn line_by_id(&self, line_id: i64) -> Result<Option<MetroLine>, LedgerError> {
        self.bounded(async {
            let row = sqlx::query("SELECT id, name, code, color FROM metro_lines WHERE id = $1")
                .bind(line_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(line_from_row).transpose()
        })
        .await
    }

    pub async fn line_by_code(&self, code: &str) -> Result<Option<MetroLine>, LedgerError> {
        self.bounded(async {
            let row = sqlx::query("SELECT id, name, code, color FROM metro_lines WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(line_from_row).transpose()
        })
        .await
    }

    /// Everything the detail view of one line needs, read at `now`.
    pub async fn line_detail(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LineDetail>, LedgerError> {
        self.bounded(async {
            let Some(line_row) =
                sqlx::query("SELECT id, name, code, color FROM metro_lines WHERE code = $1")
                    .bind(code)
                    .fetch_optional(&self.pool)
                    .await?
            else {
                return Ok::<_, sqlx::Error>(None);
            };
            let line = line_from_row(&line_row)?;

            let stations = sqlx::query(
                "SELECT id, line_id, name, position FROM stations WHERE line_id = $1 ORDER BY position ASC",
            )
            .bind(line.id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(station_from_row)
            .collect::<Result<Vec<_>, _>>()?;

            let current_status = sqlx::query(
                "SELECT id, line_id, status, message, started_at, ended_at, is_current \
                 FROM line_statuses WHERE line_id = $1 AND is_current",
            )
            .bind(line.id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(status_from_row)
            .transpose()?;

            let reports = sqlx::query(&format!(
                "{REPORT_LISTING_SELECT} WHERE ir.line_id = $1 AND ir.reported_at >= $2 ORDER BY ir.reported_at DESC, ir.id DESC"
            ))
            .bind(line.id)
            .bind(now - TimeDelta::hours(DETAIL_REPORTS_HOURS))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, _>>()?;

            let issue_history = hourly_history(
                &self.pool,
                line.id,
                now - TimeDelta::hours(DETAIL_HISTORY_HOURS),
            )
            .await?;

            Ok(Some(LineDetail {
                line,
                current_status,
                stations,
                reports,
                issue_history,
            }))
        })
        .await
    }

    pub async fn stations_for_line(&self, line_id: i64) -> Result<Vec<Station>, LedgerError> {
        self.bounded(async {
            let rows = sqlx::query(
                "SELECT id, line_id, name, position FROM stations WHERE line_id = $1 ORDER BY position ASC",
            )
            .bind(line_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(station_from_row).collect()
        })
        .await
    }

    /// Creates a line together with its initial `normal` status record.
    pub async fn create_line(
        &self,
        line: &NewMetroLine,
        now: DateTime<Utc>,
    ) -> Result<(MetroLine, StatusRecord), LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                "INSERT INTO metro_lines (name, code, color) VALUES ($1, $2, $3) RETURNING id, name, code, color",
            )
            .bind(&line.name)
            .bind(&line.code)
            .bind(&line.color)
            .fetch_one(&mut *tx)
            .await?;
            let created = line_from_row(&row)?;

            lock_line(&mut tx, created.id).await?;
            let status =
                open_status_record(&mut tx, created.id, LineStatus::Normal, None, now).await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>((created, status))
        })
        .await
    }

    pub async fn update_line(
        &self,
        line_id: i64,
        patch: &MetroLinePatch,
    ) -> Result<MetroLine, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "UPDATE metro_lines SET name = COALESCE($2, name), color = COALESCE($3, color) \
                 WHERE id = $1 RETURNING id, name, code, color",
            )
            .bind(line_id)
            .bind(patch.name.as_deref())
            .bind(patch.color.as_deref())
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => Ok(line_from_row(&row)?),
                None => Err(LedgerError::NotFound("line")),
            }
        })
        .await
    }

    pub async fn create_station(&self, station: &NewStation) -> Result<Station, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "INSERT INTO stations (line_id, name, position) VALUES ($1, $2, $3) RETURNING id, line_id, name, position",
            )
            .bind(station.line_id)
            .bind(&station.name)
            .bind(station.position)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match LedgerError::from(err) {
                LedgerError::NotFound(_) => LedgerError::NotFound("line"),
                LedgerError::Conflict(_) => LedgerError::Conflict("station position already used on line"),
                other => other,
            })?;
            Ok::<_, LedgerError>(station_from_row(&row)?)
        })
        .await
    }

    /// Returns the updated station and the code of its line.
    pub async fn update_station(
        &self,
        station_id: i64,
        patch: &StationPatch,
    ) -> Result<(Station, String), LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "UPDATE stations s SET name = COALESCE($2, s.name), position = COALESCE($3, s.position) \
                 FROM metro_lines ml WHERE s.id = $1 AND ml.id = s.line_id \
                 RETURNING s.id, s.line_id, s.name, s.position, ml.code AS line_code",
            )
            .bind(station_id)
            .bind(patch.name.as_deref())
            .bind(patch.position)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| match LedgerError::from(err) {
                LedgerError::Conflict(_) => LedgerError::Conflict("station position already used on line"),
                other => other,
            })?;

            let Some(row) = row else {
                return Err(LedgerError::NotFound("station"));
            };
            let line_code: String = row.try_get("line_code")?;
            Ok((station_from_row(&row)?, line_code))
        })
        .await
    }
}

fn line_from_row(row: &PgRow) -> Result<MetroLine, sqlx::Error> {
    Ok(MetroLine {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        color: row.try_get("color")?,
    })
}

fn station_from_row(row: &PgRow) -> Result<Station, sqlx::Error> {
    Ok(Station {
        id: row.try_get("id")?,
        line_id: row.try_get("line_id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
    })
}
