//! Shared records for the curfew API

use chrono::{DateTime, Utc};
use curfew_util::{
    ActivityId, ChildId, DaysOfWeek, DeviceId, ParentId, ScheduleId, TimeWindow, WallClock,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A parent account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: ParentId,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// A child profile owned by a parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: ChildId,
    pub parent_id: ParentId,
    pub name: String,
    pub age: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChild {
    pub parent_id: ParentId,
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
}

/// Consent state reported by the companion app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    #[default]
    Pending,
    Approved,
    Denied,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Approved => "approved",
            ConsentStatus::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConsentStatus::Pending),
            "approved" => Some(ConsentStatus::Approved),
            "denied" => Some(ConsentStatus::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered child device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub child_id: ChildId,
    pub name: String,
    pub imei: String,
    pub phone_number: String,
    pub is_locked: bool,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub consent_status: ConsentStatus,
    /// Fingerprint reported at registration, used to detect spoofed IMEIs
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDevice {
    pub child_id: ChildId,
    pub name: String,
    pub imei: String,
    pub phone_number: String,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

/// A named weekly window during which assigned devices are locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub parent_id: ParentId,
    pub name: String,
    pub start_time: WallClock,
    pub end_time: WallClock,
    pub days_of_week: DaysOfWeek,
    /// Disabled schedules never lock anything
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.days_of_week, self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub parent_id: ParentId,
    pub name: String,
    pub start_time: WallClock,
    pub end_time: WallClock,
    pub days_of_week: DaysOfWeek,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial schedule edit; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_time: Option<WallClock>,
    #[serde(default)]
    pub end_time: Option<WallClock>,
    #[serde(default)]
    pub days_of_week: Option<DaysOfWeek>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.days_of_week.is_none()
            && self.is_active.is_none()
    }

    pub fn apply_to(&self, schedule: &mut Schedule) {
        if let Some(name) = &self.name {
            schedule.name = name.clone();
        }
        if let Some(start) = self.start_time {
            schedule.start_time = start;
        }
        if let Some(end) = self.end_time {
            schedule.end_time = end;
        }
        if let Some(days) = self.days_of_week {
            schedule.days_of_week = days;
        }
        if let Some(active) = self.is_active {
            schedule.is_active = active;
        }
    }
}

/// Device/schedule association row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSchedule {
    pub id: i64,
    pub device_id: DeviceId,
    pub schedule_id: ScheduleId,
    pub created_at: DateTime<Utc>,
}

/// Action tags recorded in the activity log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityAction {
    /// Locked by an on-demand enforcement pass
    ScheduleLock,
    ScheduleUnlock,
    /// Locked by the periodic enforcement pass
    AutoScheduleLock,
    AutoScheduleUnlock,
    ManualLock,
    ManualUnlock,
    /// Locked for a fixed number of minutes through a temporary schedule
    QuickLock,
    ScheduleAssigned,
    ScheduleUnassigned,
    ScheduleUpdated,
    ScheduleDeleted,
    DeviceRegistered,
    ConsentApproved,
    ConsentDenied,
    /// Companion identity check passed
    DeviceValidated,
    /// Companion identity check failed
    SecurityAlert,
    ImeiLookup,
    /// Tag written by another producer; preserved verbatim
    Other(String),
}

impl ActivityAction {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityAction::ScheduleLock => "schedule_lock",
            ActivityAction::ScheduleUnlock => "schedule_unlock",
            ActivityAction::AutoScheduleLock => "auto_schedule_lock",
            ActivityAction::AutoScheduleUnlock => "auto_schedule_unlock",
            ActivityAction::ManualLock => "manual_lock",
            ActivityAction::ManualUnlock => "manual_unlock",
            ActivityAction::QuickLock => "quick_lock",
            ActivityAction::ScheduleAssigned => "schedule_assigned",
            ActivityAction::ScheduleUnassigned => "schedule_unassigned",
            ActivityAction::ScheduleUpdated => "schedule_updated",
            ActivityAction::ScheduleDeleted => "schedule_deleted",
            ActivityAction::DeviceRegistered => "device_registered",
            ActivityAction::ConsentApproved => "consent_approved",
            ActivityAction::ConsentDenied => "consent_denied",
            ActivityAction::DeviceValidated => "device_validated",
            ActivityAction::SecurityAlert => "security_alert",
            ActivityAction::ImeiLookup => "imei_lookup",
            ActivityAction::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "schedule_lock" => ActivityAction::ScheduleLock,
            "schedule_unlock" => ActivityAction::ScheduleUnlock,
            "auto_schedule_lock" => ActivityAction::AutoScheduleLock,
            "auto_schedule_unlock" => ActivityAction::AutoScheduleUnlock,
            "manual_lock" => ActivityAction::ManualLock,
            "manual_unlock" => ActivityAction::ManualUnlock,
            "quick_lock" => ActivityAction::QuickLock,
            "schedule_assigned" => ActivityAction::ScheduleAssigned,
            "schedule_unassigned" => ActivityAction::ScheduleUnassigned,
            "schedule_updated" => ActivityAction::ScheduleUpdated,
            "schedule_deleted" => ActivityAction::ScheduleDeleted,
            "device_registered" => ActivityAction::DeviceRegistered,
            "consent_approved" => ActivityAction::ConsentApproved,
            "consent_denied" => ActivityAction::ConsentDenied,
            "device_validated" => ActivityAction::DeviceValidated,
            "security_alert" => ActivityAction::SecurityAlert,
            "imei_lookup" => ActivityAction::ImeiLookup,
            other => ActivityAction::Other(other.to_string()),
        }
    }

    /// Whether this tag records a lock-state transition
    pub fn is_lock_transition(&self) -> bool {
        matches!(
            self,
            ActivityAction::ScheduleLock
                | ActivityAction::ScheduleUnlock
                | ActivityAction::AutoScheduleLock
                | ActivityAction::AutoScheduleUnlock
                | ActivityAction::ManualLock
                | ActivityAction::ManualUnlock
                | ActivityAction::QuickLock
        )
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActivityAction {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<ActivityAction> for String {
    fn from(action: ActivityAction) -> Self {
        action.as_str().to_string()
    }
}

/// Immutable activity log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: ActivityId,
    pub device_id: DeviceId,
    pub action: ActivityAction,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    pub device_id: DeviceId,
    pub action: ActivityAction,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewActivity {
    pub fn new(device_id: DeviceId, action: ActivityAction, description: impl Into<String>) -> Self {
        Self {
            device_id,
            action,
            description: description.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Direction of a lock transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Locked,
    Unlocked,
}

impl LockAction {
    pub fn from_locked(locked: bool) -> Self {
        if locked {
            LockAction::Locked
        } else {
            LockAction::Unlocked
        }
    }
}

/// One device changed by an enforcement pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockUpdate {
    pub device_id: DeviceId,
    pub action: LockAction,
    pub device_name: String,
}

/// Result of an on-demand enforcement pass for one parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementSummary {
    pub message: String,
    pub updates: Vec<LockUpdate>,
    pub total_devices: usize,
}

/// Result of a manual lock or unlock applied to every device of a parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkLockSummary {
    pub message: String,
    pub action: LockAction,
    /// Devices whose lock state actually changed
    pub affected_devices: usize,
    pub total_devices: usize,
}

/// Result of a quick lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickLockSummary {
    pub message: String,
    pub duration_minutes: u32,
    /// Temporary schedule keeping the device locked until the window ends
    pub schedule_id: ScheduleId,
    pub until: WallClock,
}

/// Identifiers the companion app presents when polling its status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionIdentity {
    pub phone_number: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Answer to a lookup by phone number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLookup {
    pub device_id: DeviceId,
    pub device_name: String,
    pub imei: String,
    pub phone_number: String,
    pub is_active: bool,
    pub is_locked: bool,
    pub consent_status: ConsentStatus,
}

/// Process-level summary of one periodic pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub users: usize,
    pub devices: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Read-only view used by the companion app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusView {
    pub device_id: DeviceId,
    pub name: String,
    pub is_locked: bool,
    pub consent_status: ConsentStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub active_schedules: Vec<Schedule>,
}

/// Lifecycle of the periodic enforcement driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Running,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Same user as the daemon, or root - full access
    Admin,
    /// Any other local user - read-only queries
    Observer,
}

impl ClientRole {
    pub fn can_modify(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_enforce(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub store_ok: bool,
    pub loop_state: LoopState,
    pub last_pass: Option<PassReport>,
}
