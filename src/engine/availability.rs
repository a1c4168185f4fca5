use std::collections::BTreeMap;

use crate::model::*;

/// Working windows keyed by civil date.
///
/// Only records with `date >= today` are indexed. When an administrator left
/// more than one record on a date, the first one recorded wins; windows are
/// never merged.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityIndex {
    by_date: BTreeMap<CivilDate, Availability>,
}

impl AvailabilityIndex {
    pub fn build(records: &[Availability], today: CivilDate) -> Self {
        let mut by_date = BTreeMap::new();
        for record in records.iter().filter(|a| a.date >= today) {
            by_date.entry(record.date).or_insert_with(|| record.clone());
        }
        Self { by_date }
    }

    pub fn window_for(&self, date: CivilDate) -> Option<&Availability> {
        self.by_date.get(&date)
    }

    /// Indexed dates, ascending.
    pub fn dates(&self) -> impl Iterator<Item = CivilDate> + '_ {
        self.by_date.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}

/// Non-past records ordered by date. Same-date duplicates keep their recorded order.
pub fn upcoming(records: &[Availability], today: CivilDate) -> Vec<Availability> {
    let mut out: Vec<Availability> = records.iter().filter(|a| a.date >= today).cloned().collect();
    out.sort_by_key(|a| a.date);
    out
}
