use std::fmt;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{CivilDate, Event};

const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Bookings and windows of one local date.
    Date(CivilDate),
    /// One user's urgent requests.
    UrgentRequests(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Date(date) => write!(f, "date_{date}"),
            Channel::UrgentRequests(user) => write!(f, "urgent_{user}"),
        }
    }
}

/// Push hub: views subscribe to a channel instead of polling.
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates it if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: &Channel, event: &Event) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn day() -> CivilDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Channel::Date(day()));

        let event = Event::QuotaChanged { max_bookings_per_user: Some(3) };
        hub.send(&Channel::Date(day()), &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn other_dates_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Channel::Date(day()));
        let next = day().succ_opt().unwrap();
        hub.send(&Channel::Date(next), &Event::QuotaChanged { max_bookings_per_user: None });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            &Channel::UrgentRequests("alice".into()),
            &Event::UrgentRequestResolved { id: Ulid::new(), status: crate::model::UrgentStatus::Confirmed },
        );
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Channel::UrgentRequests("alice".into()));
        let _kept = hub.subscribe(Channel::Date(day()));
        drop(rx);
        assert_eq!(hub.prune(), 1);
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::Date(day()).to_string(), "date_2025-03-10");
        assert_eq!(Channel::UrgentRequests("bob".into()).to_string(), "urgent_bob");
    }
}
