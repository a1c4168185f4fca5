use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The instant type for all interval math.
pub type Ms = i64;

/// Local calendar date with no time-of-day or zone.
pub type CivilDate = NaiveDate;

/// Local wall-clock time of day.
pub type ClockTime = NaiveTime;

pub const MINUTE_MS: Ms = 60_000;

/// Occupied length of a booking that has no reservation type attached.
pub const DEFAULT_BOOKING_DURATION_MINUTES: u32 = 60;

/// Distance between two consecutive candidate slots.
pub const DEFAULT_SLOT_GRANULARITY_MINUTES: u32 = 30;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// The single working window an administrator opened for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub date: CivilDate,
    pub from_hour: ClockTime,
    pub to_hour: ClockTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationType {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub description: Option<String>,
}

impl ReservationType {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    /// `span.start` is the booked start instant; `span.end` adds the resolved duration.
    pub span: Span,
    pub status: BookingStatus,
    pub reservation_type_id: Option<Ulid>,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Booked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrgentStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl UrgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgentStatus::Pending => "pending",
            UrgentStatus::Confirmed => "confirmed",
            UrgentStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(UrgentStatus::Pending),
            "confirmed" => Some(UrgentStatus::Confirmed),
            "rejected" => Some(UrgentStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrgentRequest {
    pub id: Ulid,
    pub user_id: String,
    pub message: String,
    pub status: UrgentStatus,
    pub submitted_at: Ms,
}

/// Everything the booking lifecycle reads and writes for one calendar.
#[derive(Debug, Clone, Default)]
pub struct CalendarState {
    /// Insertion order is the "first found" order for same-date duplicates.
    pub availability: Vec<Availability>,
    pub reservation_types: Vec<ReservationType>,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    pub max_bookings_per_user: Option<u32>,
}

impl CalendarState {
    pub fn new(max_bookings_per_user: Option<u32>) -> Self {
        Self {
            max_bookings_per_user,
            ..Self::default()
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn reservation_type(&self, id: &Ulid) -> Option<&ReservationType> {
        self.reservation_types.iter().find(|t| t.id == *id)
    }

    /// Insert a new availability record, or replace one with the same id in place.
    pub fn upsert_availability(&mut self, record: Availability) {
        match self.availability.iter_mut().find(|a| a.id == record.id) {
            Some(existing) => *existing = record,
            None => self.availability.push(record),
        }
    }

    pub fn active_count_for(&self, user_id: &str) -> usize {
        self.bookings
            .iter()
            .filter(|b| b.is_active() && b.user_id == user_id)
            .count()
    }

    /// Active bookings whose occupied interval overlaps `query`.
    pub fn overlapping_active(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_active() && b.span.end > query.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilitySet {
        id: Ulid,
        date: CivilDate,
        from_hour: ClockTime,
        to_hour: ClockTime,
    },
    ReservationTypeCreated {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        description: Option<String>,
    },
    BookingCreated {
        id: Ulid,
        user_id: String,
        span: Span,
        reservation_type_id: Option<Ulid>,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        user_id: String,
        span: Span,
    },
    UrgentRequestSubmitted {
        id: Ulid,
        user_id: String,
        message: String,
        submitted_at: Ms,
    },
    UrgentRequestResolved {
        id: Ulid,
        status: UrgentStatus,
    },
    QuotaChanged {
        max_bookings_per_user: Option<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_at(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: "alice".into(),
            span: Span::new(start, end),
            status,
            reservation_type_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut state = CalendarState::new(None);
        state.insert_booking(booking_at(300, 400, BookingStatus::Booked));
        state.insert_booking(booking_at(100, 200, BookingStatus::Booked));
        state.insert_booking(booking_at(200, 300, BookingStatus::Cancelled));
        let starts: Vec<Ms> = state.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_active_skips_cancelled_and_adjacent() {
        let mut state = CalendarState::new(None);
        state.insert_booking(booking_at(100, 200, BookingStatus::Booked));
        state.insert_booking(booking_at(200, 300, BookingStatus::Cancelled));
        state.insert_booking(booking_at(250, 350, BookingStatus::Booked));
        state.insert_booking(booking_at(1000, 1100, BookingStatus::Booked));

        let hits: Vec<_> = state.overlapping_active(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(250, 350));
    }

    #[test]
    fn active_count_ignores_cancelled_and_other_users() {
        let mut state = CalendarState::new(Some(2));
        state.insert_booking(booking_at(100, 200, BookingStatus::Booked));
        state.insert_booking(booking_at(300, 400, BookingStatus::Cancelled));
        let mut other = booking_at(500, 600, BookingStatus::Booked);
        other.user_id = "bob".into();
        state.insert_booking(other);
        assert_eq!(state.active_count_for("alice"), 1);
        assert_eq!(state.active_count_for("bob"), 1);
        assert_eq!(state.active_count_for("carol"), 0);
    }

    #[test]
    fn upsert_availability_keeps_position() {
        let mut state = CalendarState::new(None);
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let eleven = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        let first = Availability { id: Ulid::new(), date, from_hour: nine, to_hour: eleven };
        let second = Availability { id: Ulid::new(), date, from_hour: nine, to_hour: nine };
        state.upsert_availability(first.clone());
        state.upsert_availability(second.clone());

        let edited = Availability { to_hour: NaiveTime::from_hms_opt(12, 0, 0).unwrap(), ..first.clone() };
        state.upsert_availability(edited.clone());
        assert_eq!(state.availability, vec![edited, second]);
    }

    #[test]
    fn urgent_status_parse() {
        assert_eq!(UrgentStatus::parse("Confirmed"), Some(UrgentStatus::Confirmed));
        assert_eq!(UrgentStatus::parse("rejected"), Some(UrgentStatus::Rejected));
        assert_eq!(UrgentStatus::parse("maybe"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilitySet {
            id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            from_hour: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            to_hour: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
