use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;
use thiserror::Error;

use crate::limits::MAX_SLOT_GRANULARITY_MINUTES;
use crate::model::DEFAULT_SLOT_GRANULARITY_MINUTES;

const ENV_PREFIX: &str = "SLOTBOOK_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: String, value: String },
    #[error("{var}: unknown time zone {value:?}")]
    UnknownTimeZone { var: String, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: String, reason: &'static str },
}

/// Per-calendar scheduling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarConfig {
    /// Zone every civil date and wall-clock window is read in.
    pub time_zone: Tz,
    pub slot_granularity_minutes: u32,
    /// Quota a fresh calendar starts with; a `QuotaChanged` event overrides it.
    pub max_bookings_per_user: Option<u32>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            slot_granularity_minutes: DEFAULT_SLOT_GRANULARITY_MINUTES,
            max_bookings_per_user: None,
        }
    }
}

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub calendar: CalendarConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set but unparsable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            let value = lookup(&var).filter(|v| !v.trim().is_empty());
            (var, value)
        };

        let slot_granularity_minutes = parse_or(get("SLOT_MINUTES"), DEFAULT_SLOT_GRANULARITY_MINUTES)?;
        if slot_granularity_minutes == 0 || slot_granularity_minutes > MAX_SLOT_GRANULARITY_MINUTES {
            return Err(ConfigError::OutOfRange {
                var: format!("{ENV_PREFIX}SLOT_MINUTES"),
                reason: "slot granularity must be between 1 and 1440 minutes",
            });
        }
        let max_bookings_per_user: Option<u32> = parse_opt(get("MAX_BOOKINGS_PER_USER"))?;
        if max_bookings_per_user == Some(0) {
            return Err(ConfigError::OutOfRange {
                var: format!("{ENV_PREFIX}MAX_BOOKINGS_PER_USER"),
                reason: "quota must be at least 1",
            });
        }
        let time_zone = match get("TIME_ZONE") {
            (_, None) => Tz::UTC,
            (var, Some(value)) => value
                .trim()
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimeZone { var, value })?,
        };

        Ok(Self {
            port: parse_or(get("PORT"), 5433)?,
            bind: get("BIND").1.unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").1.unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").1.unwrap_or_else(|| "slotbook".into()),
            max_connections: parse_or(get("MAX_CONNECTIONS"), 256)?,
            compact_threshold: parse_or(get("COMPACT_THRESHOLD"), 1000)?,
            metrics_port: parse_opt(get("METRICS_PORT"))?,
            calendar: CalendarConfig {
                time_zone,
                slot_granularity_minutes,
                max_bookings_per_user,
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>((var, value): (String, Option<String>)) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_or<T: FromStr>(entry: (String, Option<String>), default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(entry)?.unwrap_or(default))
}
