use crate::model::Ms;

pub const MAX_CALENDARS: usize = 1_000;
pub const MAX_CALENDAR_NAME_LEN: usize = 128;

pub const MAX_USER_ID_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_URGENT_MESSAGE_LEN: usize = 4_096;

pub const MAX_BOOKINGS_PER_CALENDAR: usize = 1_000_000;
pub const MAX_AVAILABILITY_RECORDS: usize = 100_000;
pub const MAX_RESERVATION_TYPES: usize = 1_000;

/// One day; a reservation type longer than this is a data-entry mistake.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_SLOT_GRANULARITY_MINUTES: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
