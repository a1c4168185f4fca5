use chrono_tz::Tz;

use crate::model::*;

use super::civil::resolve_local;

/// Candidate start instants for one date's working window.
///
/// Starts at `date @ from_hour` and steps by `granularity_minutes` while the
/// cursor is strictly before `date @ to_hour`. A window that ends at or before
/// it starts yields nothing, as does a zero granularity.
pub fn generate_slots(
    date: CivilDate,
    from_hour: ClockTime,
    to_hour: ClockTime,
    granularity_minutes: u32,
    tz: Tz,
) -> Vec<Ms> {
    if to_hour <= from_hour || granularity_minutes == 0 {
        return Vec::new();
    }
    let (Some(mut cursor), Some(end)) = (
        resolve_local(date, from_hour, tz),
        resolve_local(date, to_hour, tz),
    ) else {
        return Vec::new();
    };
    let step = Ms::from(granularity_minutes) * MINUTE_MS;

    let mut slots = Vec::new();
    while cursor < end {
        slots.push(cursor);
        cursor += step;
    }
    slots
}

/// [`generate_slots`] for an availability record.
pub fn slots_for_window(window: &Availability, granularity_minutes: u32, tz: Tz) -> Vec<Ms> {
    generate_slots(window.date, window.from_hour, window.to_hour, granularity_minutes, tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::civil::{format_instant, parse_instant};
    use chrono::{NaiveDate, NaiveTime};
    use chrono_tz::America::Los_Angeles;
    use chrono_tz::Europe::Berlin;

    fn date() -> CivilDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn hm(h: u32, m: u32) -> ClockTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn labels(slots: &[Ms], tz: Tz) -> Vec<String> {
        slots.iter().map(|s| format_instant(*s, tz)[11..16].to_string()).collect()
    }

    #[test]
    fn two_hour_window_yields_four_half_hour_slots() {
        let slots = generate_slots(date(), hm(9, 0), hm(11, 0), 30, Berlin);
        assert_eq!(labels(&slots, Berlin), vec!["09:00", "09:30", "10:00", "10:30"]);
        assert_eq!(slots[0], parse_instant("2025-03-10T09:00:00+01:00").unwrap());
    }

    #[test]
    fn generation_is_deterministic() {
        let a = generate_slots(date(), hm(8, 15), hm(17, 0), 30, Berlin);
        let b = generate_slots(date(), hm(8, 15), hm(17, 0), 30, Berlin);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn uneven_window_keeps_last_partial_slot_start() {
        let slots = generate_slots(date(), hm(9, 0), hm(10, 15), 30, Tz::UTC);
        assert_eq!(labels(&slots, Tz::UTC), vec!["09:00", "09:30", "10:00"]);
    }

    #[test]
    fn inverted_or_empty_window_yields_nothing() {
        assert!(generate_slots(date(), hm(11, 0), hm(9, 0), 30, Tz::UTC).is_empty());
        assert!(generate_slots(date(), hm(9, 0), hm(9, 0), 30, Tz::UTC).is_empty());
    }

    #[test]
    fn zero_granularity_yields_nothing() {
        assert!(generate_slots(date(), hm(9, 0), hm(11, 0), 0, Tz::UTC).is_empty());
    }

    #[test]
    fn custom_granularity() {
        let slots = generate_slots(date(), hm(9, 0), hm(10, 0), 15, Tz::UTC);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[1] - slots[0], 15 * MINUTE_MS);
    }

    #[test]
    fn window_across_spring_forward_steps_in_real_time() {
        // 01:00–04:00 local on the LA spring-forward day spans only two real hours.
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let slots = generate_slots(day, hm(1, 0), hm(4, 0), 60, Los_Angeles);
        assert_eq!(labels(&slots, Los_Angeles), vec!["01:00", "03:00"]);
    }
}
