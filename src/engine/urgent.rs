use std::collections::HashMap;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Channel;

use super::{Engine, EngineError};

/// Urgent requests by user, in submission order.
#[derive(Debug, Default)]
pub struct UrgentLedger {
    by_user: HashMap<String, Vec<UrgentRequest>>,
    owner: HashMap<Ulid, String>,
}

impl UrgentLedger {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::UrgentRequestSubmitted { id, user_id, message, submitted_at } => {
                self.by_user.entry(user_id.clone()).or_default().push(UrgentRequest {
                    id: *id,
                    user_id: user_id.clone(),
                    message: message.clone(),
                    status: UrgentStatus::Pending,
                    submitted_at: *submitted_at,
                });
                self.owner.insert(*id, user_id.clone());
            }
            Event::UrgentRequestResolved { id, status } => {
                if let Some(req) = self.get_mut(id) {
                    req.status = *status;
                }
            }
            _ => {}
        }
    }

    /// The most recent request of `user_id`.
    pub fn latest_for(&self, user_id: &str) -> Option<&UrgentRequest> {
        self.by_user.get(user_id).and_then(|reqs| reqs.last())
    }

    pub fn get(&self, id: &Ulid) -> Option<&UrgentRequest> {
        let user = self.owner.get(id)?;
        self.by_user.get(user)?.iter().find(|r| r.id == *id)
    }

    fn get_mut(&mut self, id: &Ulid) -> Option<&mut UrgentRequest> {
        let user = self.owner.get(id)?;
        self.by_user.get_mut(user)?.iter_mut().find(|r| r.id == *id)
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.owner.contains_key(id)
    }

    /// Every request, grouped by user then in submission order.
    pub fn all(&self) -> impl Iterator<Item = &UrgentRequest> {
        self.by_user.values().flatten()
    }
}

impl Engine {
    /// Escalate a need the slot system can't serve. Refused while the user's
    /// latest request is still pending.
    pub async fn submit_urgent_request(
        &self,
        id: Ulid,
        user_id: String,
        message: String,
    ) -> Result<UrgentRequest, EngineError> {
        validate_user_id(&user_id)?;
        let message = message.trim().to_string();
        if message.is_empty() {
            return Err(EngineError::Validation("urgent request message is empty".into()));
        }
        if message.len() > MAX_URGENT_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("urgent request message too long"));
        }

        let mut ledger = self.urgent.write().await;
        if ledger.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(open) = ledger.latest_for(&user_id)
            && open.status == UrgentStatus::Pending
        {
            return Err(EngineError::UrgentRequestPending(open.id));
        }

        let event = Event::UrgentRequestSubmitted {
            id,
            user_id: user_id.clone(),
            message,
            submitted_at: self.now(),
        };
        self.wal_append(&event).await?;
        ledger.apply(&event);
        self.notify.send(&Channel::UrgentRequests(user_id.clone()), &event);
        metrics::counter!(crate::observability::URGENT_REQUESTS_TOTAL).increment(1);
        info!("urgent request {id} submitted by {user_id}");

        ledger
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Administrative decision on a pending request.
    pub async fn resolve_urgent_request(
        &self,
        id: Ulid,
        status: UrgentStatus,
    ) -> Result<UrgentRequest, EngineError> {
        if status == UrgentStatus::Pending {
            return Err(EngineError::Validation("an urgent request can only be confirmed or rejected".into()));
        }
        let mut ledger = self.urgent.write().await;
        let current = ledger.get(&id).ok_or(EngineError::NotFound(id))?;
        if current.status != UrgentStatus::Pending {
            return Err(EngineError::Validation(format!(
                "urgent request {id} is already {}",
                current.status.as_str()
            )));
        }
        let user_id = current.user_id.clone();

        let event = Event::UrgentRequestResolved { id, status };
        self.wal_append(&event).await?;
        ledger.apply(&event);
        self.notify.send(&Channel::UrgentRequests(user_id), &event);
        info!("urgent request {id} {}", status.as_str());

        ledger.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn urgent_request_for(&self, user_id: &str) -> Option<UrgentRequest> {
        self.urgent.read().await.latest_for(user_id).cloned()
    }
}

pub(super) fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Validation("user id is empty".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(user: &str, at: Ms) -> Event {
        Event::UrgentRequestSubmitted {
            id: Ulid::new(),
            user_id: user.into(),
            message: "need a slot this week".into(),
            submitted_at: at,
        }
    }

    #[test]
    fn latest_is_last_submitted() {
        let mut ledger = UrgentLedger::default();
        let first = submitted("alice", 1);
        let second = submitted("alice", 2);
        ledger.apply(&first);
        ledger.apply(&second);
        assert_eq!(ledger.latest_for("alice").map(|r| r.submitted_at), Some(2));
        assert!(ledger.latest_for("bob").is_none());
        assert_eq!(ledger.all().count(), 2);
    }

    #[test]
    fn resolution_updates_status() {
        let mut ledger = UrgentLedger::default();
        let event = submitted("alice", 1);
        let Event::UrgentRequestSubmitted { id, .. } = &event else { unreachable!() };
        let id = *id;
        ledger.apply(&event);
        ledger.apply(&Event::UrgentRequestResolved { id, status: UrgentStatus::Rejected });
        assert_eq!(ledger.get(&id).map(|r| r.status), Some(UrgentStatus::Rejected));
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let mut ledger = UrgentLedger::default();
        ledger.apply(&Event::QuotaChanged { max_bookings_per_user: Some(1) });
        assert_eq!(ledger.all().count(), 0);
    }
}
