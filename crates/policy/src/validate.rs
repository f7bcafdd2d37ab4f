use transit_contracts::{
    LineStatus, MetroLinePatch, NewIssueReport, NewMetroLine, NewStation, StationPatch,
    StatusOverride,
};

use crate::infer_status;

pub const DESCRIPTION_MAX_CHARS: usize = 140;

const NAME_MAX_CHARS: usize = 120;
const CODE_MAX_CHARS: usize = 32;
const MESSAGE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportValidationError {
    message: String,
}

impl ReportValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ReportValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReportValidationError {}

/// A report that passed validation, with its status resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedReport {
    pub line_id: i64,
    pub station_id: Option<i64>,
    pub issue_type: transit_contracts::IssueType,
    pub description: Option<String>,
    pub status: LineStatus,
}

pub fn validate_report(report: &NewIssueReport) -> Result<ValidatedReport, ReportValidationError> {
    require_positive_id(report.line_id, "line_id")?;
    if let Some(station_id) = report.station_id {
        require_positive_id(station_id, "station_id")?;
    }

    let description = normalize_optional_text(report.description.as_deref());
    if let Some(description) = description.as_deref()
        && description.chars().count() > DESCRIPTION_MAX_CHARS
    {
        return Err(ReportValidationError::new(format!(
            "description must be at most {} characters",
            DESCRIPTION_MAX_CHARS
        )));
    }

    let inferred = infer_status(report.issue_type);
    if let Some(claimed) = report.status
        && claimed != inferred
    {
        return Err(ReportValidationError::new(format!(
            "status `{}` does not match issue type `{}`",
            claimed, report.issue_type
        )));
    }

    Ok(ValidatedReport {
        line_id: report.line_id,
        station_id: report.station_id,
        issue_type: report.issue_type,
        description,
        status: inferred,
    })
}

pub fn validate_new_line(line: &NewMetroLine) -> Result<NewMetroLine, ReportValidationError> {
    let name = require_text(&line.name, "name", NAME_MAX_CHARS)?;
    let code = require_text(&line.code, "code", CODE_MAX_CHARS)?;
    if !code
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
    {
        return Err(ReportValidationError::new(
            "code may only contain ASCII letters, digits, `-` and `_`",
        ));
    }
    let color = require_color(&line.color)?;

    Ok(NewMetroLine { name, code, color })
}

pub fn validate_line_patch(patch: &MetroLinePatch) -> Result<MetroLinePatch, ReportValidationError> {
    if patch.name.is_none() && patch.color.is_none() {
        return Err(ReportValidationError::new(
            "line update must set name or color",
        ));
    }

    let name = patch
        .name
        .as_deref()
        .map(|name| require_text(name, "name", NAME_MAX_CHARS))
        .transpose()?;
    let color = patch.color.as_deref().map(require_color).transpose()?;

    Ok(MetroLinePatch { name, color })
}

pub fn validate_new_station(station: &NewStation) -> Result<NewStation, ReportValidationError> {
    require_positive_id(station.line_id, "line_id")?;
    let name = require_text(&station.name, "name", NAME_MAX_CHARS)?;
    require_position(station.position)?;

    Ok(NewStation {
        line_id: station.line_id,
        name,
        position: station.position,
    })
}

pub fn validate_station_patch(patch: &StationPatch) -> Result<StationPatch, ReportValidationError> {
    if patch.name.is_none() && patch.position.is_none() {
        return Err(ReportValidationError::new(
            "station update must set name or position",
        ));
    }

    let name = patch
        .name
        .as_deref()
        .map(|name| require_text(name, "name", NAME_MAX_CHARS))
        .transpose()?;
    if let Some(position) = patch.position {
        require_position(position)?;
    }

    Ok(StationPatch {
        name,
        position: patch.position,
    })
}

pub fn validate_status_override(
    status_override: &StatusOverride,
) -> Result<StatusOverride, ReportValidationError> {
    let message = normalize_optional_text(status_override.message.as_deref());
    if let Some(message) = message.as_deref()
        && message.chars().count() > MESSAGE_MAX_CHARS
    {
        return Err(ReportValidationError::new(format!(
            "message must be at most {} characters",
            MESSAGE_MAX_CHARS
        )));
    }

    Ok(StatusOverride {
        status: status_override.status,
        message,
    })
}

fn normalize_optional_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_text(
    raw: &str,
    field: &'static str,
    max_chars: usize,
) -> Result<String, ReportValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ReportValidationError::new(format!(
            "{} must not be empty",
            field
        )));
    }
    if value.chars().count() > max_chars {
        return Err(ReportValidationError::new(format!(
            "{} must be at most {} characters",
            field, max_chars
        )));
    }
    Ok(value.to_string())
}

fn require_color(raw: &str) -> Result<String, ReportValidationError> {
    let value = raw.trim();
    let valid = value
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(ReportValidationError::new(
            "color must be a hex color such as #0255a5",
        ));
    }
    Ok(value.to_ascii_lowercase())
}

fn require_positive_id(id: i64, field: &'static str) -> Result<(), ReportValidationError> {
    if id <= 0 {
        return Err(ReportValidationError::new(format!(
            "{} must be a positive integer",
            field
        )));
    }
    Ok(())
}

fn require_position(position: i32) -> Result<(), ReportValidationError> {
    if position < 1 {
        return Err(ReportValidationError::new("position must be >= 1"));
    }
    Ok(())
}
