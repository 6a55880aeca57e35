use crate::error::{ExpandError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Parse an ISO 8601 date or date-time into a naive timestamp.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH`, `YYYY-MM-DDTHH:MM` and
/// `YYYY-MM-DDTHH:MM:SS[.fff]`, with `T` or a space as separator and an
/// optional trailing `Z`.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_suffix('Z').unwrap_or(trimmed);

    let (date_part, time_part) = match trimmed.find(|c| c == 'T' || c == ' ') {
        Some(pos) => (&trimmed[..pos], Some(&trimmed[pos + 1..])),
        None => (trimmed, None),
    };

    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| ExpandError::config(format!("Invalid timestamp '{}': {}", value, e)))?;

    let time = match time_part {
        None => NaiveTime::MIN,
        Some(t) => parse_time_of_day(t)
            .ok_or_else(|| ExpandError::config(format!("Invalid time of day in '{}'", value)))?,
    };

    Ok(date.and_time(time))
}

fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    // chrono insists on minutes, so a bare hour is handled here
    if value.len() <= 2 && !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let hour = value.parse::<u32>().ok()?;
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }

    ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(value, fmt).ok())
}

/// Format a timestamp the way it appears in CF `units` attributes.
pub fn format_cf_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
}
