use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::config::CalendarConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine per calendar. A calendar is the database name of the pgwire
/// connection; each has its own WAL file and compactor task.
pub struct CalendarRegistry {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    calendar_config: CalendarConfig,
}

impl CalendarRegistry {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, calendar_config: CalendarConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            calendar_config,
        }
    }

    /// Get or lazily open the engine for `calendar`.
    ///
    /// Engines are keyed by the sanitized name, the same stem the WAL file
    /// uses, so aliases such as `clinic.a` and `clinica` share one engine.
    pub fn get_or_create(&self, calendar: &str) -> io::Result<Arc<Engine>> {
        if calendar.len() > MAX_CALENDAR_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "calendar name too long"));
        }
        let safe_name = sanitize(calendar);
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty calendar name"));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_CALENDARS {
            return Err(io::Error::other("too many calendars"));
        }

        // Two connections may race to open the same calendar; the entry lock
        // makes the second one reuse the first engine.
        let entry = self.engines.entry(safe_name.clone());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.calendar_config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!("opened calendar {safe_name}");
        metrics::gauge!(crate::observability::CALENDARS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Keep the name a plain file stem.
fn sanitize(calendar: &str) -> String {
    calendar
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_registry").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn registry(dir: PathBuf) -> CalendarRegistry {
        CalendarRegistry::new(dir, 1000, CalendarConfig::default())
    }

    #[tokio::test]
    async fn calendars_are_isolated() {
        let reg = registry(test_data_dir("isolation"));
        let a = reg.get_or_create("clinic_a").unwrap();
        let b = reg.get_or_create("clinic_b").unwrap();

        a.set_availability(
            Ulid::new(),
            NaiveDate::from_ymd_opt(2199, 3, 10).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(a.list_all_availability().await.len(), 1);
        assert!(b.list_all_availability().await.is_empty());
    }

    #[tokio::test]
    async fn lazy_creation_writes_wal_file() {
        let dir = test_data_dir("lazy");
        let reg = registry(dir.clone());
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        reg.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let reg = registry(test_data_dir("same"));
        let one = reg.get_or_create("foo").unwrap();
        let two = reg.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&one, &two));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = test_data_dir("sanitize");
        let reg = registry(dir.clone());
        reg.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(reg.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn aliases_share_one_engine() {
        let dir = test_data_dir("aliases");
        let reg = registry(dir.clone());
        let dotted = reg.get_or_create("clinic.a").unwrap();
        let plain = reg.get_or_create("clinica").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));
        let escaped = reg.get_or_create("../evil").unwrap();
        assert!(Arc::ptr_eq(&escaped, &reg.get_or_create("evil").unwrap()));
        assert_eq!(reg.len(), 2);

        let date = NaiveDate::from_ymd_opt(2199, 3, 10).unwrap();
        dotted
            .set_availability(
                Ulid::new(),
                date,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        let start = crate::engine::parse_instant("2199-03-10T09:00:00Z").unwrap();
        dotted.create_booking(Ulid::new(), "alice".into(), start, None).await.unwrap();
        let err = plain
            .create_booking(Ulid::new(), "bob".into(), start, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::engine::ErrorKind::Conflict);

        // A fresh registry over the same directory replays one booking.
        let reopened = registry(dir).get_or_create("clinica").unwrap();
        let active: Vec<_> = reopened
            .list_bookings()
            .await
            .into_iter()
            .filter(|b| b.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "alice");
    }

    #[tokio::test]
    async fn name_length_is_limited() {
        let reg = registry(test_data_dir("too_long"));
        let err = reg
            .get_or_create(&"x".repeat(MAX_CALENDAR_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("calendar name too long"));
    }
}
