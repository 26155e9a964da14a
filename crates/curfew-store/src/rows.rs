//! Raw row shapes and their conversion into API records

use chrono::{DateTime, SecondsFormat, Utc};
use curfew_api::{ActivityAction, ActivityEntry, Child, ConsentStatus, Device, DeviceSchedule, Schedule};
use curfew_util::{ActivityId, ChildId, DaysOfWeek, DeviceId, ParentId, ScheduleId, WallClock};
use rusqlite::Row;

use crate::{StoreError, StoreResult};

pub(crate) const CHILD_COLUMNS: &str = "c.id, c.parent_id, c.name, c.age, c.created_at";

pub(crate) const DEVICE_COLUMNS: &str = "d.id, d.child_id, d.name, d.imei, d.phone_number, \
     d.is_locked, d.is_active, d.last_seen, d.consent_status, d.device_fingerprint, d.created_at";

pub(crate) const SCHEDULE_COLUMNS: &str = "s.id, s.parent_id, s.name, s.start_time, s.end_time, \
     s.days_of_week, s.is_active, s.created_at";

pub(crate) const ACTIVITY_COLUMNS: &str =
    "a.id, a.device_id, a.action, a.description, a.metadata, a.timestamp";

/// Fixed-width UTC timestamps so text ordering matches time ordering
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}

/// Whitespace-free phone number used for uniqueness and lookup
pub(crate) fn phone_key(phone_number: &str) -> String {
    phone_number.split_whitespace().collect()
}

pub(crate) struct ChildRow {
    id: i64,
    parent_id: String,
    name: String,
    age: Option<u32>,
    created_at: String,
}

impl ChildRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            name: row.get(2)?,
            age: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    pub(crate) fn into_child(self) -> StoreResult<Child> {
        Ok(Child {
            id: ChildId::new(self.id),
            parent_id: ParentId::new(self.parent_id),
            name: self.name,
            age: self.age,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub(crate) struct DeviceRow {
    id: i64,
    child_id: i64,
    name: String,
    imei: String,
    phone_number: String,
    is_locked: bool,
    is_active: bool,
    last_seen: Option<String>,
    consent_status: String,
    device_fingerprint: Option<String>,
    created_at: String,
}

impl DeviceRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            child_id: row.get(1)?,
            name: row.get(2)?,
            imei: row.get(3)?,
            phone_number: row.get(4)?,
            is_locked: row.get(5)?,
            is_active: row.get(6)?,
            last_seen: row.get(7)?,
            consent_status: row.get(8)?,
            device_fingerprint: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub(crate) fn into_device(self) -> StoreResult<Device> {
        let consent_status = ConsentStatus::parse(&self.consent_status).ok_or_else(|| {
            StoreError::Serialization(format!("invalid consent status '{}'", self.consent_status))
        })?;
        let last_seen = self.last_seen.as_deref().map(parse_timestamp).transpose()?;

        Ok(Device {
            id: DeviceId::new(self.id),
            child_id: ChildId::new(self.child_id),
            name: self.name,
            imei: self.imei,
            phone_number: self.phone_number,
            is_locked: self.is_locked,
            is_active: self.is_active,
            last_seen,
            consent_status,
            device_fingerprint: self.device_fingerprint,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub(crate) struct ScheduleRow {
    id: i64,
    parent_id: String,
    name: String,
    start_time: String,
    end_time: String,
    days_of_week: String,
    is_active: bool,
    created_at: String,
}

impl ScheduleRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            name: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            days_of_week: row.get(5)?,
            is_active: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Malformed times are an error. A malformed day set is not: it reads
    /// back as the empty set and the schedule never matches.
    pub(crate) fn into_schedule(self) -> StoreResult<Schedule> {
        let start_time = WallClock::parse(&self.start_time)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let end_time = WallClock::parse(&self.end_time)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Schedule {
            id: ScheduleId::new(self.id),
            parent_id: ParentId::new(self.parent_id),
            name: self.name,
            start_time,
            end_time,
            days_of_week: DaysOfWeek::from_stored(&self.days_of_week),
            is_active: self.is_active,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub(crate) struct AssociationRow {
    id: i64,
    device_id: i64,
    schedule_id: i64,
    created_at: String,
}

impl AssociationRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            schedule_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub(crate) fn into_association(self) -> StoreResult<DeviceSchedule> {
        Ok(DeviceSchedule {
            id: self.id,
            device_id: DeviceId::new(self.device_id),
            schedule_id: ScheduleId::new(self.schedule_id),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub(crate) struct ActivityRow {
    id: i64,
    device_id: i64,
    action: String,
    description: String,
    metadata: Option<String>,
    timestamp: String,
}

impl ActivityRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            action: row.get(2)?,
            description: row.get(3)?,
            metadata: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    pub(crate) fn into_entry(self) -> StoreResult<ActivityEntry> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()?;

        Ok(ActivityEntry {
            id: ActivityId::new(self.id),
            device_id: DeviceId::new(self.device_id),
            action: ActivityAction::parse(&self.action),
            description: self.description,
            metadata,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_key_strips_all_whitespace() {
        assert_eq!(phone_key("+91 98765 43210"), "+919876543210");
        assert_eq!(phone_key("\t555 0100\n"), "5550100");
    }

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = format_timestamp(parse_timestamp("2024-01-01T22:05:00Z").unwrap());
        let later = format_timestamp(parse_timestamp("2024-01-01T22:05:00.5Z").unwrap());
        assert!(earlier < later);
        assert_eq!(earlier, "2024-01-01T22:05:00.000000Z");
    }

    #[test]
    fn bad_timestamp_is_serialization_error() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(StoreError::Serialization(_))
        ));
    }
}
