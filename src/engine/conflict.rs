use chrono_tz::Tz;

use crate::model::*;

use super::civil::normalize;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Why a candidate slot was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRejection {
    /// Today, and already started.
    Past,
    /// Overlaps an active booking.
    Taken(ulid::Ulid),
}

/// Judge one candidate slot `[start, start + granularity)` against `now` and the bookings.
pub fn judge_slot(
    start: Ms,
    bookings: &[Booking],
    now: Ms,
    granularity_ms: Ms,
    tz: Tz,
) -> Result<(), SlotRejection> {
    // Only today's slots are time-filtered; other days never compare against now.
    if start < now && normalize(start, tz) == normalize(now, tz) {
        return Err(SlotRejection::Past);
    }
    let slot_end = start + granularity_ms;
    for b in bookings.iter().filter(|b| b.is_active()) {
        let starts_inside_booking = start >= b.span.start && start < b.span.end;
        let booking_starts_inside_slot = b.span.start >= start && b.span.start < slot_end;
        if starts_inside_booking || booking_starts_inside_slot {
            return Err(SlotRejection::Taken(b.id));
        }
    }
    Ok(())
}

/// Keep the candidates that are neither past (today only) nor overlapping an
/// active booking. Input order is preserved.
pub fn available_slots(
    candidates: &[Ms],
    bookings: &[Booking],
    now: Ms,
    granularity_ms: Ms,
    tz: Tz,
) -> Vec<Ms> {
    candidates
        .iter()
        .copied()
        .filter(|s| judge_slot(*s, bookings, now, granularity_ms, tz).is_ok())
        .collect()
}

/// Full occupied-interval check for a booking about to be committed.
pub(crate) fn check_no_conflict(state: &CalendarState, span: &Span) -> Result<(), EngineError> {
    match state.overlapping_active(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::civil::parse_instant;
    use crate::engine::slots::generate_slots;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    const HALF_HOUR: Ms = 30 * MINUTE_MS;

    fn at(s: &str) -> Ms {
        parse_instant(s).unwrap()
    }

    fn booked(start: &str, minutes: Ms) -> Booking {
        let start = at(start);
        Booking {
            id: Ulid::new(),
            user_id: "alice".into(),
            span: Span::new(start, start + minutes * MINUTE_MS),
            status: BookingStatus::Booked,
            reservation_type_id: None,
            created_at: 0,
        }
    }

    fn morning() -> Vec<Ms> {
        generate_slots(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            30,
            Tz::UTC,
        )
    }

    const LONG_AGO: &str = "2025-01-01T00:00:00Z";

    #[test]
    fn no_bookings_keeps_everything() {
        let slots = available_slots(&morning(), &[], at(LONG_AGO), HALF_HOUR, Tz::UTC);
        assert_eq!(slots, morning());
    }

    #[test]
    fn hour_long_booking_removes_two_slots() {
        let bookings = vec![booked("2025-03-10T09:30:00Z", 60)];
        let slots = available_slots(&morning(), &bookings, at(LONG_AGO), HALF_HOUR, Tz::UTC);
        assert_eq!(slots, vec![at("2025-03-10T09:00:00Z"), at("2025-03-10T10:30:00Z")]);
    }

    #[test]
    fn short_booking_inside_slot_removes_that_slot() {
        // 10-minute booking starting mid-slot: booking start falls inside [09:00, 09:30).
        let bookings = vec![booked("2025-03-10T09:10:00Z", 10)];
        let slots = available_slots(&morning(), &bookings, at(LONG_AGO), HALF_HOUR, Tz::UTC);
        assert_eq!(slots.len(), 3);
        assert!(!slots.contains(&at("2025-03-10T09:00:00Z")));
    }

    #[test]
    fn booking_ending_at_slot_start_does_not_block() {
        let bookings = vec![booked("2025-03-10T08:30:00Z", 30)];
        let slots = available_slots(&morning(), &bookings, at(LONG_AGO), HALF_HOUR, Tz::UTC);
        assert_eq!(slots, morning());
    }

    #[test]
    fn cancelled_bookings_are_ignored() {
        let mut b = booked("2025-03-10T09:30:00Z", 60);
        b.status = BookingStatus::Cancelled;
        let slots = available_slots(&morning(), &[b], at(LONG_AGO), HALF_HOUR, Tz::UTC);
        assert_eq!(slots, morning());
    }

    #[test]
    fn past_slots_today_are_dropped() {
        let now = at("2025-03-10T10:15:00Z");
        let slots = available_slots(&morning(), &[], now, HALF_HOUR, Tz::UTC);
        assert_eq!(slots, vec![at("2025-03-10T10:30:00Z")]);
        assert_eq!(
            judge_slot(at("2025-03-10T09:30:00Z"), &[], now, HALF_HOUR, Tz::UTC),
            Err(SlotRejection::Past)
        );
    }

    #[test]
    fn other_days_are_never_time_filtered() {
        // "now" is the day after; the slots are on a different civil date.
        let now = at("2025-03-11T10:15:00Z");
        let slots = available_slots(&morning(), &[], now, HALF_HOUR, Tz::UTC);
        assert_eq!(slots, morning());
    }

    #[test]
    fn today_is_judged_in_calendar_zone() {
        // 00:30 Berlin on Mar 11 is 23:30 UTC Mar 10: in Berlin the morning slots are yesterday.
        let now = at("2025-03-11T00:30:00+01:00");
        let berlin = chrono_tz::Europe::Berlin;
        let slots = generate_slots(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            30,
            berlin,
        );
        assert_eq!(available_slots(&slots, &[], now, HALF_HOUR, berlin).len(), 4);
        // Read in UTC the same instants are "today" and all past.
        assert!(available_slots(&slots, &[], now, HALF_HOUR, Tz::UTC).is_empty());
    }

    #[test]
    fn check_no_conflict_catches_long_bookings() {
        let mut state = CalendarState::new(None);
        state.insert_booking(booked("2025-03-10T11:00:00Z", 30));
        // 10:30 + 60 min runs into the 11:00 booking even though 10:30 is a free slot.
        let start = at("2025-03-10T10:30:00Z");
        let result = check_no_conflict(&state, &Span::new(start, start + 60 * MINUTE_MS));
        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert!(check_no_conflict(&state, &Span::new(start, start + HALF_HOUR)).is_ok());
    }
}
