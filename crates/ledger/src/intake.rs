use chrono::{DateTime, Utc};
use transit_contracts::{IntakeDecision, SubmissionRecord};
use transit_policy::{intake_decision, window_start};

use crate::{LedgerError, TransitLedger};

impl TransitLedger {
    pub async fn count_submissions(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let count = self
            .bounded(
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM report_submissions WHERE ip_address = $1 AND submitted_at >= $2",
                )
                .bind(ip_address)
                .bind(since)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Counts the identity's submissions in the trailing window. Does not record.
    pub async fn check_intake(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<IntakeDecision, LedgerError> {
        let count = self.count_submissions(ip_address, window_start(now)).await?;
        Ok(intake_decision(count))
    }

    /// Records an accepted submission and drops the identity's rows that fell
    /// out of the window.
    pub async fn record_submission(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmissionRecord, LedgerError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;

            let (ip_address, submitted_at): (String, DateTime<Utc>) = sqlx::query_as(
                "INSERT INTO report_submissions (ip_address, submitted_at) VALUES ($1, $2) \
                 RETURNING ip_address, submitted_at",
            )
            .bind(ip_address)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM report_submissions WHERE ip_address = $1 AND submitted_at < $2")
                .bind(ip_address.as_str())
                .bind(window_start(now))
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(SubmissionRecord {
                ip_address,
                submitted_at,
            })
        })
        .await
    }

    /// Drops every submission row that is past the window relative to `now`.
    pub async fn prune_submissions(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM report_submissions WHERE submitted_at < $1")
                    .bind(window_start(now))
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }
}
