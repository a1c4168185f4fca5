mod availability;
mod civil;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod snapshot;
mod urgent;

pub use availability::{upcoming, AvailabilityIndex};
pub use civil::{format_instant, normalize, parse_civil_date, parse_clock_time, parse_instant, resolve_local};
pub use conflict::{available_slots, judge_slot, SlotRejection};
pub use error::{EngineError, ErrorKind};
pub use slots::{generate_slots, slots_for_window};
pub use snapshot::ScheduleSnapshot;
pub use urgent::UrgentLedger;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crate::config::CalendarConfig;
use crate::model::*;
use crate::notify::{Channel, NotifyHub};
use crate::wal::Wal;

/// Source of "now". Swappable so callers can pin the clock.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One calendar: a single shared booking set plus its urgent-request ledger.
pub struct Engine {
    pub(super) state: RwLock<CalendarState>,
    pub(super) urgent: RwLock<UrgentLedger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: CalendarConfig,
    pub(super) clock: Clock,
}

/// Apply a calendar event (no locking; caller holds the lock).
pub(super) fn apply_to_calendar(state: &mut CalendarState, event: &Event) {
    match event {
        Event::AvailabilitySet { id, date, from_hour, to_hour } => {
            state.upsert_availability(Availability {
                id: *id,
                date: *date,
                from_hour: *from_hour,
                to_hour: *to_hour,
            });
        }
        Event::ReservationTypeCreated { id, name, duration_minutes, description } => {
            state.reservation_types.push(ReservationType {
                id: *id,
                name: name.clone(),
                duration_minutes: *duration_minutes,
                description: description.clone(),
            });
        }
        Event::BookingCreated { id, user_id, span, reservation_type_id, created_at } => {
            state.insert_booking(Booking {
                id: *id,
                user_id: user_id.clone(),
                span: *span,
                status: BookingStatus::Booked,
                reservation_type_id: *reservation_type_id,
                created_at: *created_at,
            });
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = state.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::QuotaChanged { max_bookings_per_user } => {
            state.max_bookings_per_user = *max_bookings_per_user;
        }
        // Urgent requests live in their own ledger.
        Event::UrgentRequestSubmitted { .. } | Event::UrgentRequestResolved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: CalendarConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = CalendarState::new(config.max_bookings_per_user);
        let mut urgent = UrgentLedger::default();
        for event in &events {
            apply_to_calendar(&mut state, event);
            urgent.apply(event);
        }
        info!(
            "calendar {} replayed {} events ({} bookings)",
            wal_path.display(),
            events.len(),
            state.bookings.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            urgent: RwLock::new(urgent),
            wal_tx,
            notify,
            config,
            clock: Arc::new(conflict::now_ms),
        })
    }

    /// Replace the clock used for "now" comparisons.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CalendarConfig {
        &self.config
    }

    pub(super) fn now(&self) -> Ms {
        (self.clock)()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append + apply + notify. The state is untouched if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut CalendarState,
        event: &Event,
        channel: Option<Channel>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_calendar(state, event);
        if let Some(channel) = channel {
            self.notify.send(&channel, event);
        }
        Ok(())
    }

    /// Channel carrying changes to the bookings of the date `instant` falls on.
    pub(super) fn date_channel(&self, instant: Ms) -> Option<Channel> {
        normalize(instant, self.config.time_zone).map(Channel::Date)
    }
}
