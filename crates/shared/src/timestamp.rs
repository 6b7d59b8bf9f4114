//! Lenient timestamp parsing and calendar arithmetic.

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid timestamp '{0}': expected YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS or RFC 3339")]
pub struct TimestampError(pub String);

/// Parse a timestamp supplied by a caller.
///
/// Accepts a bare date, a date and time without offset (both taken as UTC),
/// or a full RFC 3339 timestamp.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let value = value.trim();

    if let Ok(date) = Date::parse(value, format_description!("[year]-[month]-[day]")) {
        return Ok(date.midnight().assume_utc());
    }

    if let Ok(local) = PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    ) {
        return Ok(local.assume_utc());
    }

    OffsetDateTime::parse(value, &Rfc3339).map_err(|_| TimestampError(value.to_string()))
}

/// Add whole calendar years, rolling Feb 29 over to Mar 1 in non-leap years.
///
/// Returns `None` if the result falls outside the representable range.
pub fn add_years(at: OffsetDateTime, years: i32) -> Option<OffsetDateTime> {
    let year = at.year().checked_add(years)?;
    let date = match Date::from_calendar_date(year, at.month(), at.day()) {
        Ok(date) => date,
        Err(_) => Date::from_calendar_date(year, Month::March, 1).ok()?,
    };
    Some(at.replace_date(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_date_only() {
        assert_eq!(
            parse_timestamp("2024-03-05").unwrap(),
            datetime!(2024-03-05 00:00 UTC)
        );
    }

    #[test]
    fn test_parse_local_datetime_as_utc() {
        assert_eq!(
            parse_timestamp("2024-03-05T13:45:10").unwrap(),
            datetime!(2024-03-05 13:45:10 UTC)
        );
    }

    #[test]
    fn test_parse_rfc3339_keeps_offset() {
        let parsed = parse_timestamp("2024-03-05T13:45:10-07:00").unwrap();
        assert_eq!(parsed, datetime!(2024-03-05 20:45:10 UTC));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("next tuesday").is_err());
        assert!(parse_timestamp("2024-13-40").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_add_years() {
        assert_eq!(
            add_years(datetime!(2023-06-15 10:00 UTC), 2),
            Some(datetime!(2025-06-15 10:00 UTC))
        );
    }

    #[test]
    fn test_add_years_leap_day_rolls_over() {
        assert_eq!(
            add_years(datetime!(2024-02-29 08:30 UTC), 1),
            Some(datetime!(2025-03-01 08:30 UTC))
        );
        assert_eq!(
            add_years(datetime!(2024-02-29 08:30 UTC), 4),
            Some(datetime!(2028-02-29 08:30 UTC))
        );
    }
}
