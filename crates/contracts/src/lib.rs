use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    Normal,
    Delayed,
    Stopped,
}

impl LineStatus {
    pub const ALL: [LineStatus; 3] = [LineStatus::Normal, LineStatus::Delayed, LineStatus::Stopped];

    pub fn as_str(self) -> &'static str {
        match self {
            LineStatus::Normal => "normal",
            LineStatus::Delayed => "delayed",
            LineStatus::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "normal" => Some(LineStatus::Normal),
            "delayed" => Some(LineStatus::Delayed),
            "stopped" => Some(LineStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for LineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Delay,
    Stopped,
    Crowded,
    Technical,
    Other,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Delay => "delay",
            IssueType::Stopped => "stopped",
            IssueType::Crowded => "crowded",
            IssueType::Technical => "technical",
            IssueType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "delay" => Some(IssueType::Delay),
            "stopped" => Some(IssueType::Stopped),
            "crowded" => Some(IssueType::Crowded),
            "technical" => Some(IssueType::Technical),
            "other" => Some(IssueType::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetroLine {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: i64,
    pub line_id: i64,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: i64,
    pub line_id: i64,
    pub status: LineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub id: i64,
    pub line_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<i64>,
    pub issue_type: IssueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: LineStatus,
    pub reported_at: DateTime<Utc>,
}

/// One rate-limit bookkeeping row: who submitted and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub ip_address: String,
    pub submitted_at: DateTime<Utc>,
}

/// A report joined with the names a reader needs to display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportListing {
    #[serde(flatten)]
    pub report: IssueReport,
    pub line_code: String,
    pub line_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
}

/// Directory entry for the public line list. `status` is `None` when the line
/// has never had a status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSummary {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub color: String,
    pub status: Option<LineStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyIssueCount {
    pub hour: DateTime<Utc>,
    pub issues: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDetail {
    #[serde(flatten)]
    pub line: MetroLine,
    pub current_status: Option<StatusRecord>,
    pub stations: Vec<Station>,
    pub reports: Vec<ReportListing>,
    pub issue_history: Vec<HourlyIssueCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineIssueCount {
    pub line_id: i64,
    pub name: String,
    pub color: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeIssueCount {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyIssueCount {
    pub day: DateTime<Utc>,
    pub label: String,
    pub issues: i64,
}

/// Look-back window for statistics queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsWindow {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[default]
    #[serde(rename = "30d")]
    Month,
}

impl StatsWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            StatsWindow::Day => "24h",
            StatsWindow::Week => "7d",
            StatsWindow::Month => "30d",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "24h" => Some(StatsWindow::Day),
            "7d" => Some(StatsWindow::Week),
            "30d" => Some(StatsWindow::Month),
            _ => None,
        }
    }

    pub fn duration(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            StatsWindow::Day => Duration::from_secs(24 * HOUR),
            StatsWindow::Week => Duration::from_secs(7 * 24 * HOUR),
            StatsWindow::Month => Duration::from_secs(30 * 24 * HOUR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub window: StatsWindow,
    pub trend_window: StatsWindow,
    pub issues_by_line: Vec<LineIssueCount>,
    pub issues_by_type: Vec<TypeIssueCount>,
    pub daily_trend: Vec<DailyIssueCount>,
}

/// Outcome of the intake guard for one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum IntakeDecision {
    Allowed,
    Denied { count: u32 },
}

impl IntakeDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, IntakeDecision::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewIssueReport {
    pub line_id: i64,
    #[serde(default)]
    pub station_id: Option<i64>,
    pub issue_type: IssueType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<LineStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewMetroLine {
    pub name: String,
    pub code: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetroLinePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewStation {
    pub line_id: i64,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusOverride {
    pub status: LineStatus,
    #[serde(default)]
    pub message: Option<String>,
}
