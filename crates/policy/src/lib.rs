use chrono::{DateTime, TimeDelta, Utc};
use transit_contracts::{IntakeDecision, IssueType, LineStatus};

mod validate;

pub use self::validate::{
    DESCRIPTION_MAX_CHARS, ReportValidationError, ValidatedReport, validate_line_patch,
    validate_new_line, validate_new_station, validate_report, validate_station_patch,
    validate_status_override,
};

/// Trailing window used both for intake counting and for re-evaluation.
pub const WINDOW_SECS: i64 = 60 * 60;

/// Submissions allowed per identity inside the window.
pub const INTAKE_MAX_SUBMISSIONS: u32 = 3;

pub const STOPPED_REPORT_THRESHOLD: i64 = 5;
pub const DELAYED_REPORT_THRESHOLD: i64 = 3;

pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::seconds(WINDOW_SECS)
}

pub fn infer_status(issue_type: IssueType) -> LineStatus {
    match issue_type {
        IssueType::Delay => LineStatus::Delayed,
        IssueType::Stopped => LineStatus::Stopped,
        IssueType::Crowded | IssueType::Technical | IssueType::Other => LineStatus::Normal,
    }
}

pub fn intake_decision(submissions_in_window: u64) -> IntakeDecision {
    if submissions_in_window < u64::from(INTAKE_MAX_SUBMISSIONS) {
        IntakeDecision::Allowed
    } else {
        IntakeDecision::Denied {
            count: u32::try_from(submissions_in_window).unwrap_or(u32::MAX),
        }
    }
}

pub fn denial_message(count: u32) -> String {
    format!(
        "rate limit exceeded: at most {} reports per hour are accepted; {} reports were submitted in the last hour",
        INTAKE_MAX_SUBMISSIONS, count
    )
}

/// Operational state of a line. `Unknown` means no status record exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Unknown,
    Known(LineStatus),
}

impl LineState {
    pub fn from_current(current: Option<LineStatus>) -> Self {
        match current {
            Some(status) => LineState::Known(status),
            None => LineState::Unknown,
        }
    }

    pub fn status(self) -> Option<LineStatus> {
        match self {
            LineState::Unknown => None,
            LineState::Known(status) => Some(status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    Automatic,
    Manual,
}

impl TransitionTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionTrigger::Automatic => "automatic",
            TransitionTrigger::Manual => "manual",
        }
    }
}

/// Automatic transition rule, run after a report was recorded.
///
/// `recent_reports` counts every report of the line inside the window,
/// including the one just submitted. Returns the status to open, or `None`
/// when the line keeps its current record.
pub fn evaluate_transition(
    recent_reports: i64,
    submitted: LineStatus,
    current: LineState,
) -> Option<LineStatus> {
    if recent_reports >= STOPPED_REPORT_THRESHOLD && submitted == LineStatus::Stopped {
        return Some(LineStatus::Stopped);
    }

    if recent_reports >= DELAYED_REPORT_THRESHOLD
        && submitted == LineStatus::Delayed
        && current == LineState::Known(LineStatus::Normal)
    {
        return Some(LineStatus::Delayed);
    }

    None
}
