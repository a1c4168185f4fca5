use chrono_tz::Tz;

use crate::model::*;

use super::availability::AvailabilityIndex;
use super::civil::normalize;
use super::conflict::available_slots;
use super::slots::slots_for_window;

/// A consistent, timestamped copy of one calendar's schedule.
///
/// Slot queries run against a snapshot instead of live state; staleness is
/// settled by the re-check at commit time.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub taken_at: Ms,
    pub time_zone: Tz,
    pub granularity_minutes: u32,
    pub availability: Vec<Availability>,
    pub bookings: Vec<Booking>,
}

impl ScheduleSnapshot {
    pub fn today(&self) -> Option<CivilDate> {
        normalize(self.taken_at, self.time_zone)
    }

    pub fn index(&self) -> AvailabilityIndex {
        match self.today() {
            Some(today) => AvailabilityIndex::build(&self.availability, today),
            None => AvailabilityIndex::default(),
        }
    }

    fn granularity_ms(&self) -> Ms {
        Ms::from(self.granularity_minutes) * MINUTE_MS
    }

    /// Bookable start instants on `date`, ascending. Empty when the date has no window.
    pub fn available_slots(&self, date: CivilDate) -> Vec<Ms> {
        let index = self.index();
        self.slots_in(&index, date)
    }

    fn slots_in(&self, index: &AvailabilityIndex, date: CivilDate) -> Vec<Ms> {
        let Some(window) = index.window_for(date) else {
            return Vec::new();
        };
        let candidates = slots_for_window(window, self.granularity_minutes, self.time_zone);
        available_slots(
            &candidates,
            &self.bookings,
            self.taken_at,
            self.granularity_ms(),
            self.time_zone,
        )
    }

    /// Dates with a window and at least one bookable slot left.
    pub fn bookable_dates(&self) -> Vec<CivilDate> {
        let index = self.index();
        index
            .dates()
            .filter(|date| !self.slots_in(&index, *date).is_empty())
            .collect()
    }
}
