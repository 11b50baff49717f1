//! Timestamp parsing shared by both feeds.
//!
//! Feeds mix offset-aware ISO strings, naive local strings and epoch numbers.
//! Everything is normalized to a timezone-naive local wall clock.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(epoch) = parse_epoch(trimmed, tz) {
        return Some(epoch);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&trimmed.replacen(' ', "T", 1)) {
        return Some(dt.naive_local());
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Some(dt.naive_local());
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn floor_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date().and_hms_opt(ts.hour(), 0, 0).unwrap_or(ts)
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_epoch(raw: &str, tz: Tz) -> Option<NaiveDateTime> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.len() < 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = raw.parse::<i64>().ok()?;
    // Epoch cells arrive as seconds or milliseconds depending on the export.
    let millis = if value.abs() >= 100_000_000_000 {
        value
    } else {
        value.checked_mul(1_000)?
    };
    tz.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Kathmandu;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn offset_aware_values_keep_local_wall_clock() {
        assert_eq!(
            parse_timestamp("2024-01-05T08:45:00+05:45", Kathmandu),
            Some(local(2024, 1, 5, 8, 45))
        );
        assert_eq!(
            parse_timestamp("2024-01-05 08:45:00+05:45", Kathmandu),
            Some(local(2024, 1, 5, 8, 45))
        );
        assert_eq!(
            parse_timestamp("2024-01-05T03:00:00Z", Kathmandu),
            Some(local(2024, 1, 5, 3, 0))
        );
    }

    #[test]
    fn naive_and_date_only_forms_parse() {
        assert_eq!(
            parse_timestamp("2024-03-01T10:15", Kathmandu),
            Some(local(2024, 3, 1, 10, 15))
        );
        assert_eq!(
            parse_timestamp("2024-03-01 10:15:00", Kathmandu),
            Some(local(2024, 3, 1, 10, 15))
        );
        assert_eq!(
            parse_timestamp("2024-03-01", Kathmandu),
            Some(local(2024, 3, 1, 0, 0))
        );
    }

    #[test]
    fn epoch_values_convert_into_configured_timezone() {
        // 2024-01-01T00:00:00Z is 05:45 in Kathmandu.
        assert_eq!(
            parse_timestamp("1704067200", Kathmandu),
            Some(local(2024, 1, 1, 5, 45))
        );
        assert_eq!(
            parse_timestamp("1704067200000", Kathmandu),
            Some(local(2024, 1, 1, 5, 45))
        );
    }

    #[test]
    fn garbage_is_coerced_to_none() {
        assert_eq!(parse_timestamp("", Kathmandu), None);
        assert_eq!(parse_timestamp("not a date", Kathmandu), None);
        assert_eq!(parse_timestamp("42", Kathmandu), None);
    }

    #[test]
    fn floor_drops_minutes_and_seconds() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_milli_opt(13, 59, 59, 999)
            .unwrap();
        assert_eq!(floor_to_hour(ts), local(2024, 1, 1, 13, 0));
        assert_eq!(format_timestamp(floor_to_hour(ts)), "2024-01-01 13:00:00");
    }
}
