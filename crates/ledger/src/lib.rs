use std::future::Future;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use transit_contracts::{IssueType, LineStatus};

mod directory;
mod intake;
mod reports;
mod stats;
mod status;

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    NotFound(&'static str),
    Conflict(&'static str),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::NotFound(what) => write!(f, "{} not found", what),
            LedgerError::Conflict(what) => write!(f, "conflict: {}", what),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        let code = value
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());

        match code.as_deref() {
            Some("23505") => LedgerError::Conflict("unique constraint violated"),
            Some("23503") => LedgerError::NotFound("referenced row"),
            _ => LedgerError::Sqlx(value),
        }
    }
}

#[derive(Clone)]
pub struct TransitLedger {
    pool: sqlx::PgPool,
    timeout: Duration,
}

impl TransitLedger {
    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self { pool, timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::connect(db_url, max_connections, timeout).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs a storage call under the configured timeout.
    async fn bounded<T, E, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<LedgerError>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LedgerError::Timeout)?
            .map_err(Into::into)
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn decode_status(raw: &str) -> Result<LineStatus, sqlx::Error> {
    LineStatus::parse(raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown line status `{}`", raw).into()))
}

fn decode_issue_type(raw: &str) -> Result<IssueType, sqlx::Error> {
    IssueType::parse(raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown issue type `{}`", raw).into()))
}
