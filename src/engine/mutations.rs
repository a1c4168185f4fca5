use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_CANCELLED_TOTAL, BOOKINGS_CREATED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::availability::AvailabilityIndex;
use super::civil::{normalize, validate_instant};
use super::conflict::{check_no_conflict, judge_slot, SlotRejection};
use super::slots::slots_for_window;
use super::urgent::validate_user_id;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Book `date_time` for `user_id`.
    ///
    /// The whole read-check-append-apply sequence runs under the calendar write
    /// lock, so two creates racing for one slot serialize and the second sees
    /// the first.
    pub async fn create_booking(
        &self,
        id: Ulid,
        user_id: String,
        date_time: Ms,
        reservation_type_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let result = self
            .try_create_booking(id, user_id, date_time, reservation_type_id)
            .await;
        match &result {
            Ok(booking) => {
                metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
                info!("booking {} created for {} at {}", booking.id, booking.user_id, booking.span.start);
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "kind" => e.kind().as_str()).increment(1);
                debug!("booking {id} rejected: {e}");
            }
        }
        result
    }

    async fn try_create_booking(
        &self,
        id: Ulid,
        user_id: String,
        date_time: Ms,
        reservation_type_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_user_id(&user_id)?;
        validate_instant(date_time)?;

        let mut guard = self.state.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many bookings in calendar"));
        }
        if guard.booking(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let duration_ms = match reservation_type_id {
            Some(type_id) => guard
                .reservation_type(&type_id)
                .ok_or(EngineError::UnknownReservationType(type_id))?
                .duration_ms(),
            None => Ms::from(DEFAULT_BOOKING_DURATION_MINUTES) * MINUTE_MS,
        };

        if let Some(limit) = guard.max_bookings_per_user
            && guard.active_count_for(&user_id) >= limit as usize
        {
            return Err(EngineError::QuotaExceeded { limit });
        }

        self.check_slot(&guard, date_time)?;
        let span = Span::new(date_time, date_time + duration_ms);
        check_no_conflict(&guard, &span)?;

        let event = Event::BookingCreated {
            id,
            user_id,
            span,
            reservation_type_id,
            created_at: self.now(),
        };
        let channel = self.date_channel(date_time);
        self.persist_and_apply(&mut guard, &event, channel).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Re-run slot generation and filtering on live state for one instant.
    fn check_slot(&self, state: &CalendarState, date_time: Ms) -> Result<(), EngineError> {
        let tz = self.config.time_zone;
        let now = self.now();
        let (Some(date), Some(today)) = (normalize(date_time, tz), normalize(now, tz)) else {
            return Err(EngineError::SlotUnavailable(date_time));
        };
        let index = AvailabilityIndex::build(&state.availability, today);
        let window = index
            .window_for(date)
            .ok_or(EngineError::NoAvailability(date))?;
        let granularity = self.config.slot_granularity_minutes;
        if !slots_for_window(window, granularity, tz).contains(&date_time) {
            return Err(EngineError::SlotUnavailable(date_time));
        }
        let granularity_ms = Ms::from(granularity) * MINUTE_MS;
        match judge_slot(date_time, &state.bookings, now, granularity_ms, tz) {
            Ok(()) => Ok(()),
            Err(SlotRejection::Past) => Err(EngineError::SlotUnavailable(date_time)),
            Err(SlotRejection::Taken(existing)) => Err(EngineError::Conflict(existing)),
        }
    }

    /// Soft-cancel: the record stays with status `Cancelled` and its interval
    /// is bookable again immediately.
    pub async fn cancel_booking(&self, id: Ulid, requesting_user_id: &str) -> Result<Booking, EngineError> {
        let mut guard = self.state.write().await;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        if booking.user_id != requesting_user_id {
            return Err(EngineError::NotOwner(id));
        }

        let event = Event::BookingCancelled {
            id,
            user_id: booking.user_id.clone(),
            span: booking.span,
        };
        let channel = self.date_channel(booking.span.start);
        self.persist_and_apply(&mut guard, &event, channel).await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled by {requesting_user_id}");
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Open (or edit in place, when `id` already exists) the working window of a date.
    pub async fn set_availability(
        &self,
        id: Ulid,
        date: CivilDate,
        from_hour: ClockTime,
        to_hour: ClockTime,
    ) -> Result<Availability, EngineError> {
        if to_hour <= from_hour {
            return Err(EngineError::Validation(format!(
                "window {from_hour}-{to_hour} ends before it starts"
            )));
        }
        let mut guard = self.state.write().await;
        let editing = guard.availability.iter().any(|a| a.id == id);
        if !editing && guard.availability.len() >= MAX_AVAILABILITY_RECORDS {
            return Err(EngineError::LimitExceeded("too many availability records"));
        }

        let event = Event::AvailabilitySet { id, date, from_hour, to_hour };
        self.persist_and_apply(&mut guard, &event, Some(crate::notify::Channel::Date(date)))
            .await?;
        info!("availability {id} set for {date} {from_hour}-{to_hour}");
        Ok(Availability { id, date, from_hour, to_hour })
    }

    pub async fn create_reservation_type(
        &self,
        id: Ulid,
        name: String,
        duration_minutes: u32,
        description: Option<String>,
    ) -> Result<ReservationType, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("reservation type name is empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("reservation type name too long"));
        }
        if let Some(ref d) = description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::Validation(format!(
                "duration must be between 1 and {MAX_DURATION_MINUTES} minutes"
            )));
        }

        let mut guard = self.state.write().await;
        if guard.reservation_types.len() >= MAX_RESERVATION_TYPES {
            return Err(EngineError::LimitExceeded("too many reservation types"));
        }
        if guard.reservation_type(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ReservationTypeCreated {
            id,
            name: name.clone(),
            duration_minutes,
            description: description.clone(),
        };
        self.persist_and_apply(&mut guard, &event, None).await?;
        Ok(ReservationType { id, name, duration_minutes, description })
    }

    /// Replace the calendar-wide booking limit. `None` disables it.
    pub async fn set_quota(&self, max_bookings_per_user: Option<u32>) -> Result<(), EngineError> {
        if max_bookings_per_user == Some(0) {
            return Err(EngineError::Validation("quota must be at least 1".into()));
        }
        let mut guard = self.state.write().await;
        let event = Event::QuotaChanged { max_bookings_per_user };
        self.persist_and_apply(&mut guard, &event, None).await?;
        info!("quota set to {max_bookings_per_user:?}");
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold both locks so no mutation lands between snapshot and swap.
        let state = self.state.read().await;
        let ledger = self.urgent.read().await;

        let mut events = Vec::with_capacity(
            state.availability.len() + state.reservation_types.len() + state.bookings.len() + 1,
        );
        events.push(Event::QuotaChanged {
            max_bookings_per_user: state.max_bookings_per_user,
        });
        for a in &state.availability {
            events.push(Event::AvailabilitySet {
                id: a.id,
                date: a.date,
                from_hour: a.from_hour,
                to_hour: a.to_hour,
            });
        }
        for t in &state.reservation_types {
            events.push(Event::ReservationTypeCreated {
                id: t.id,
                name: t.name.clone(),
                duration_minutes: t.duration_minutes,
                description: t.description.clone(),
            });
        }
        for b in &state.bookings {
            events.push(Event::BookingCreated {
                id: b.id,
                user_id: b.user_id.clone(),
                span: b.span,
                reservation_type_id: b.reservation_type_id,
                created_at: b.created_at,
            });
            if !b.is_active() {
                events.push(Event::BookingCancelled {
                    id: b.id,
                    user_id: b.user_id.clone(),
                    span: b.span,
                });
            }
        }
        let mut requests: Vec<&UrgentRequest> = ledger.all().collect();
        requests.sort_by_key(|r| (r.submitted_at, r.id));
        for r in requests {
            events.push(Event::UrgentRequestSubmitted {
                id: r.id,
                user_id: r.user_id.clone(),
                message: r.message.clone(),
                submitted_at: r.submitted_at,
            });
            if r.status != UrgentStatus::Pending {
                events.push(Event::UrgentRequestResolved { id: r.id, status: r.status });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
