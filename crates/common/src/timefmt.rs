//! Wall-clock timestamp formats used in feedback and position records.
//!
//! Timestamps travel as UnixDate-style strings (`Mon Jan  2 15:04:05 UTC
//! 2006`, day-of-month space-padded). The agent always emits UTC; on parse
//! the zone token is accepted positionally but the timestamp is interpreted
//! as UTC, since the agent only ever reads timestamps it wrote itself.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Layout for the UnixDate-style wire format, minus the zone token.
const UNIX_DATE_NO_ZONE: &str = "%a %b %e %H:%M:%S %Y";

/// Layout for applied-plan archive file names.
const ARCHIVE_DATE_CODE: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp {input:?}")]
pub struct TimeParseError {
    pub input: String,
}

/// Format `t` in the UnixDate wire shape, always in UTC.
pub fn format_unix_date(t: DateTime<Utc>) -> String {
    t.format("%a %b %e %H:%M:%S UTC %Y").to_string()
}

/// Parse a UnixDate-style string.
///
/// The five leading fields and the trailing year are positional; the zone
/// token is ignored and the result is interpreted as UTC.
pub fn parse_unix_date(input: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let fields: Vec<&str> = input.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(TimeParseError {
            input: input.to_string(),
        });
    }
    // [dow, month, day, clock, zone, year] with the zone dropped
    let without_zone = format!(
        "{} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], fields[5]
    );
    let naive = NaiveDateTime::parse_from_str(&without_zone, UNIX_DATE_NO_ZONE).map_err(|_| {
        TimeParseError {
            input: input.to_string(),
        }
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Compact date code used in applied-plan archive file names.
pub fn archive_date_code(t: DateTime<Utc>) -> String {
    t.format(ARCHIVE_DATE_CODE).to_string()
}
