//! Time utilities for curfew
//!
//! Provides wall-clock primitives for weekly lock windows, time-zone
//! resolution, and an injectable [`Clock`].
//!
//! # Mock Time for Development
//!
//! In debug builds, the `CURFEW_MOCK_TIME` environment variable can be set
//! to override the system time seen by [`SystemClock`]. The value is read as
//! UTC and advances at the normal rate from process start.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2024-01-01 22:05:00`)
//!
//! ```bash
//! CURFEW_MOCK_TIME="2024-01-01 22:05:00" curfewd
//! ```

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use crate::CurfewError;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "CURFEW_MOCK_TIME";

/// Zone used when a caller supplies no usable time-zone hint
pub const DEFAULT_TIME_ZONE: &str = "Asia/Calcutta";

static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match NaiveDateTime::parse_from_str(&mock_time_str, "%Y-%m-%d %H:%M:%S") {
                    Ok(naive_dt) => {
                        let mock_dt = Utc.from_utc_datetime(&naive_dt);
                        let offset = mock_dt.signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    Err(_) => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            expected_format = "%Y-%m-%d %H:%M:%S",
                            "Invalid mock time format"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current instant, respecting mock time settings in debug builds.
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();

    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Source of the current instant.
///
/// The enforcement engine reads time only through this trait so a pass can
/// be replayed at any instant in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real clock (with debug-build mock time support)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        now()
    }
}

/// Manually driven clock for tests and replay
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Mutex::new(instant),
        }
    }

    /// Parse an RFC 3339 instant, panicking on malformed input.
    /// Intended for test fixtures.
    pub fn at(rfc3339: &str) -> Self {
        let instant = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap_or_else(|e| panic!("invalid fixture instant {rfc3339}: {e}"))
            .with_timezone(&Utc);
        Self::new(instant)
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.lock() = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.lock();
        *guard += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.instant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Parse an IANA time-zone identifier such as `"Asia/Calcutta"`.
pub fn parse_time_zone(name: &str) -> Result<Tz, CurfewError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CurfewError::UnknownTimeZone(name.to_string()))
}

/// The built-in fallback zone
pub fn default_time_zone() -> Tz {
    parse_time_zone(DEFAULT_TIME_ZONE).unwrap_or(chrono_tz::Asia::Kolkata)
}

/// Resolve an optional caller hint, falling back when it is absent or unknown.
pub fn resolve_time_zone(hint: Option<&str>, fallback: Tz) -> Tz {
    match hint.map(str::trim).filter(|h| !h.is_empty()) {
        None => fallback,
        Some(name) => match parse_time_zone(name) {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(hint = %name, fallback = %fallback, "Unknown time zone hint, using fallback");
                fallback
            }
        },
    }
}

/// Local wall-clock time of day at minute resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
}

impl WallClock {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    /// Parse `HH:MM` (24-hour). A single-digit hour is tolerated.
    pub fn parse(s: &str) -> Result<Self, CurfewError> {
        let (hour, minute) = s
            .split_once(':')
            .ok_or_else(|| CurfewError::invalid_time(s, "expected HH:MM format"))?;

        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(CurfewError::invalid_time(s, "expected HH:MM format"));
        }

        let hour: u8 = hour
            .parse()
            .map_err(|_| CurfewError::invalid_time(s, "invalid hour"))?;
        let minute: u8 = minute
            .parse()
            .map_err(|_| CurfewError::invalid_time(s, "invalid minute"))?;

        if hour >= 24 {
            return Err(CurfewError::invalid_time(s, "hour must be 0-23"));
        }
        if minute >= 60 {
            return Err(CurfewError::invalid_time(s, "minute must be 0-59"));
        }

        Ok(Self { hour, minute })
    }

    /// Truncates seconds and below.
    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    pub fn minutes_from_midnight(&self) -> u16 {
        (self.hour as u16) * 60 + self.minute as u16
    }
}

impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.minutes_from_midnight()
            .cmp(&other.minutes_from_midnight())
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for WallClock {
    type Err = CurfewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WallClock {
    type Error = CurfewError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WallClock> for String {
    fn from(value: WallClock) -> Self {
        value.to_string()
    }
}

/// Lowercase weekday names indexed from Sunday
pub const WEEKDAY_NAMES: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// Weekday index with Sunday = 0
pub fn weekday_index(weekday: Weekday) -> u8 {
    weekday.num_days_from_sunday() as u8
}

/// Map a weekday name (`"monday"`) to its index
pub fn weekday_from_name(name: &str) -> Option<u8> {
    let lower = name.trim().to_ascii_lowercase();
    WEEKDAY_NAMES
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u8)
}

/// Serialized day-set array as found in storage.
///
/// Older rows carry weekday names, newer ones carry indices. The first entry
/// decides which encoding the whole array is read as; entries of the other
/// kind are skipped. Normalised into [`DaysOfWeek`] right after parsing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct StoredDays(Vec<serde_json::Value>);

impl From<StoredDays> for DaysOfWeek {
    fn from(StoredDays(entries): StoredDays) -> Self {
        let by_name = entries.first().is_some_and(serde_json::Value::is_string);
        DaysOfWeek::from_indices(entries.iter().filter_map(|entry| {
            if by_name {
                entry.as_str().and_then(weekday_from_name)
            } else {
                entry.as_i64().and_then(|i| u8::try_from(i).ok())
            }
        }))
    }
}

/// Set of weekdays, bit `i` set for weekday index `i` (Sunday = 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "StoredDays", into = "Vec<u8>")]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const SUNDAY: u8 = 1 << 0;
    pub const MONDAY: u8 = 1 << 1;
    pub const TUESDAY: u8 = 1 << 2;
    pub const WEDNESDAY: u8 = 1 << 3;
    pub const THURSDAY: u8 = 1 << 4;
    pub const FRIDAY: u8 = 1 << 5;
    pub const SATURDAY: u8 = 1 << 6;

    pub const WEEKDAYS: DaysOfWeek = DaysOfWeek(
        Self::MONDAY | Self::TUESDAY | Self::WEDNESDAY | Self::THURSDAY | Self::FRIDAY,
    );
    pub const WEEKENDS: DaysOfWeek = DaysOfWeek(Self::SATURDAY | Self::SUNDAY);
    pub const ALL_DAYS: DaysOfWeek = DaysOfWeek(0x7F);
    pub const NONE: DaysOfWeek = DaysOfWeek(0);

    pub fn new(mask: u8) -> Self {
        Self(mask & 0x7F)
    }

    /// Build from weekday indices; out-of-range indices are ignored.
    pub fn from_indices(indices: impl IntoIterator<Item = u8>) -> Self {
        let mut days = Self::NONE;
        for index in indices {
            days.insert_index(index);
        }
        days
    }

    /// Parse the stored JSON form. Malformed payloads yield the empty set.
    pub fn from_stored(raw: &str) -> Self {
        match serde_json::from_str::<StoredDays>(raw) {
            Ok(stored) => stored.into(),
            Err(e) => {
                tracing::debug!(raw = %raw, error = %e, "Malformed days-of-week payload, treating as empty");
                Self::NONE
            }
        }
    }

    /// Canonical stored form: a JSON array of indices
    pub fn to_stored(&self) -> String {
        let indices = self.indices();
        serde_json::to_string(&indices).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn insert_index(&mut self, index: u8) {
        if index < 7 {
            self.0 |= 1 << index;
        }
    }

    pub fn contains_index(&self, index: u8) -> bool {
        index < 7 && (self.0 & (1 << index)) != 0
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        self.contains_index(weekday_index(weekday))
    }

    pub fn indices(&self) -> Vec<u8> {
        (0..7).filter(|i| self.contains_index(*i)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DaysOfWeek {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl From<DaysOfWeek> for Vec<u8> {
    fn from(days: DaysOfWeek) -> Self {
        days.indices()
    }
}

/// A weekly recurring window in local wall-clock time.
///
/// Both bounds are inclusive. A window whose start is later than its end
/// crosses midnight. The day check always uses the current local calendar
/// day, so the after-midnight part of an overnight window only applies when
/// the following day is also in `days`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: DaysOfWeek,
    pub start: WallClock,
    pub end: WallClock,
}

impl TimeWindow {
    pub fn new(days: DaysOfWeek, start: WallClock, end: WallClock) -> Self {
        Self { days, start, end }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Check a local weekday and time of day against this window
    pub fn contains_local(&self, weekday: Weekday, time: WallClock) -> bool {
        if !self.days.contains(weekday) {
            return false;
        }

        // Zero-length window is never active
        if self.start == self.end {
            return false;
        }

        if self.start < self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }

    /// Check an instant, converted into `tz`, against this window
    pub fn contains_at(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
        let (weekday, time) = local_day_and_time(instant, tz);
        self.contains_local(weekday, time)
    }
}

/// Local weekday and minute-resolution time of day for an instant in `tz`
pub fn local_day_and_time(instant: DateTime<Utc>, tz: Tz) -> (Weekday, WallClock) {
    use chrono::Datelike;

    let local = instant.with_timezone(&tz);
    (local.weekday(), WallClock::from_naive_time(local.time()))
}
