use crate::model::*;

use super::availability::upcoming;
use super::civil::normalize;
use super::snapshot::ScheduleSnapshot;
use super::Engine;

impl Engine {
    /// Timestamped copy of availability and bookings, taken under the read lock.
    pub async fn snapshot(&self) -> ScheduleSnapshot {
        let guard = self.state.read().await;
        ScheduleSnapshot {
            taken_at: self.now(),
            time_zone: self.config.time_zone,
            granularity_minutes: self.config.slot_granularity_minutes,
            availability: guard.availability.clone(),
            bookings: guard.bookings.clone(),
        }
    }

    pub async fn available_slots(&self, date: CivilDate) -> Vec<Ms> {
        self.snapshot().await.available_slots(date)
    }

    /// Dates that still offer at least one slot.
    pub async fn bookable_dates(&self) -> Vec<CivilDate> {
        self.snapshot().await.bookable_dates()
    }

    /// All bookings, every status, ordered by start.
    pub async fn list_bookings(&self) -> Vec<Booking> {
        self.state.read().await.bookings.clone()
    }

    pub async fn bookings_for_user(&self, user_id: &str) -> Vec<Booking> {
        let guard = self.state.read().await;
        guard
            .bookings
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn active_booking_count(&self, user_id: &str) -> usize {
        self.state.read().await.active_count_for(user_id)
    }

    /// Windows from today on, ordered by date.
    pub async fn list_availability(&self) -> Vec<Availability> {
        let guard = self.state.read().await;
        match normalize(self.now(), self.config.time_zone) {
            Some(today) => upcoming(&guard.availability, today),
            None => Vec::new(),
        }
    }

    /// Every stored window, past ones included, in insertion order.
    pub async fn list_all_availability(&self) -> Vec<Availability> {
        self.state.read().await.availability.clone()
    }

    pub async fn list_reservation_types(&self) -> Vec<ReservationType> {
        self.state.read().await.reservation_types.clone()
    }

    pub async fn quota(&self) -> Option<u32> {
        self.state.read().await.max_bookings_per_user
    }
}
