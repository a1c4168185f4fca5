//! Calendar date normalization.
//!
//! Every date comparison in the engine routes through [`normalize`]: the civil
//! date is read in the calendar's own zone, never by formatting to UTC and
//! slicing the string back apart.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, Offset, SecondsFormat, TimeDelta, TimeZone};
use chrono_tz::Tz;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::EngineError;

/// Local calendar date of `instant` in `tz`.
///
/// Two instants map to the same date iff they fall on the same local day.
/// Returns `None` only for instants chrono cannot represent.
pub fn normalize(instant: Ms, tz: Tz) -> Option<CivilDate> {
    DateTime::from_timestamp_millis(instant).map(|utc| utc.with_timezone(&tz).date_naive())
}

/// Instant at which the wall clock in `tz` shows `time` on `date`.
///
/// Ambiguous wall times (clocks going back) resolve to the earlier instant.
/// Wall times skipped by a forward transition resolve to the same reading
/// shifted forward by the gap.
pub fn resolve_local(date: CivilDate, time: ClockTime, tz: Tz) -> Option<Ms> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => {
            let before = naive.checked_sub_signed(TimeDelta::hours(3))?;
            let offset = tz.offset_from_local_datetime(&before).earliest()?.fix();
            let utc = naive.checked_sub_signed(TimeDelta::seconds(offset.local_minus_utc().into()))?;
            Some(utc.and_utc().timestamp_millis())
        }
    }
}

pub fn validate_instant(instant: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&instant) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Parse an RFC 3339 instant. The offset is mandatory.
pub fn parse_instant(s: &str) -> Result<Ms, EngineError> {
    let dt = DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| EngineError::Validation(format!("bad instant {s:?}: {e}")))?;
    let ms = dt.timestamp_millis();
    validate_instant(ms)?;
    Ok(ms)
}

pub fn parse_civil_date(s: &str) -> Result<CivilDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| EngineError::Validation(format!("bad date {s:?}: {e}")))
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_clock_time(s: &str) -> Result<ClockTime, EngineError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| EngineError::Validation(format!("bad clock time {s:?}: {e}")))
}

/// RFC 3339 rendering of `instant` in the calendar's zone.
pub fn format_instant(instant: Ms, tz: Tz) -> String {
    DateTime::from_timestamp_millis(instant)
        .map(|utc| utc.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::Secs, false))
        .unwrap_or_else(|| instant.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;
    use chrono_tz::Europe::Berlin;

    fn date(y: i32, m: u32, d: u32) -> CivilDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> ClockTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn normalize_uses_local_day_not_utc() {
        // 23:30 in Los Angeles on Oct 24 is 06:30 UTC on Oct 25.
        let instant = parse_instant("2024-10-24T23:30:00-07:00").unwrap();
        assert_eq!(normalize(instant, Los_Angeles), Some(date(2024, 10, 24)));
        assert_eq!(normalize(instant, Tz::UTC), Some(date(2024, 10, 25)));
    }

    #[test]
    fn normalize_just_after_local_midnight() {
        // 00:15 in Berlin is still the previous day in UTC.
        let instant = parse_instant("2025-03-10T00:15:00+01:00").unwrap();
        assert_eq!(normalize(instant, Berlin), Some(date(2025, 3, 10)));
        assert_eq!(normalize(instant, Tz::UTC), Some(date(2025, 3, 9)));
    }

    #[test]
    fn same_local_day_same_date() {
        let morning = resolve_local(date(2025, 3, 10), time(0, 0), Berlin).unwrap();
        let night = resolve_local(date(2025, 3, 10), NaiveTime::from_hms_opt(23, 59, 59).unwrap(), Berlin).unwrap();
        assert_eq!(normalize(morning, Berlin), normalize(night, Berlin));
        assert_ne!(normalize(night + 1000, Berlin), normalize(night, Berlin));
    }

    #[test]
    fn resolve_local_round_trips() {
        let ms = resolve_local(date(2025, 3, 10), time(9, 30), Berlin).unwrap();
        assert_eq!(ms, parse_instant("2025-03-10T09:30:00+01:00").unwrap());
        assert_eq!(format_instant(ms, Berlin), "2025-03-10T09:30:00+01:00");
    }

    #[test]
    fn resolve_local_in_spring_forward_gap() {
        // 02:30 does not exist in Los Angeles on 2024-03-10; it reads as 03:30 PDT.
        let ms = resolve_local(date(2024, 3, 10), time(2, 30), Los_Angeles).unwrap();
        assert_eq!(ms, parse_instant("2024-03-10T03:30:00-07:00").unwrap());
    }

    #[test]
    fn resolve_local_ambiguous_takes_earlier() {
        // 01:30 happens twice in Los Angeles on 2024-11-03.
        let ms = resolve_local(date(2024, 11, 3), time(1, 30), Los_Angeles).unwrap();
        assert_eq!(ms, parse_instant("2024-11-03T01:30:00-07:00").unwrap());
    }

    #[test]
    fn parse_instant_requires_offset() {
        assert!(parse_instant("2025-03-10T09:30:00").is_err());
        assert!(parse_instant("2025-03-10T09:30:00Z").is_ok());
        assert!(matches!(
            parse_instant("1960-01-01T00:00:00Z"),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn parse_clock_time_formats() {
        assert_eq!(parse_clock_time("09:00").unwrap(), time(9, 0));
        assert_eq!(parse_clock_time("17:45:00").unwrap(), time(17, 45));
        assert!(parse_clock_time("25:00").is_err());
    }

    #[test]
    fn parse_civil_date_rejects_garbage() {
        assert_eq!(parse_civil_date("2025-03-10").unwrap(), date(2025, 3, 10));
        assert!(parse_civil_date("10/03/2025").is_err());
        assert!(parse_civil_date("2025-02-30").is_err());
    }
}
