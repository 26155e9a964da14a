//! Command types for the curfewd protocol

use curfew_util::{ClientId, DeviceId, ParentId, ScheduleId};
use serde::{Deserialize, Serialize};

use crate::{
    API_VERSION, ActivityEntry, BulkLockSummary, Child, ClientRole, CompanionIdentity,
    ConsentStatus, Device, DeviceLookup, DeviceSchedule, DeviceStatusView, EnforcementSummary,
    HealthStatus, NewChild, NewDevice, NewSchedule, PassReport, QuickLockSummary, Schedule,
    ScheduleUpdate, User,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    PermissionDenied,
    Conflict,
    StoreError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Run enforcement for one parent's devices
    Enforce {
        parent_id: ParentId,
        /// IANA zone name; the configured default applies when absent
        #[serde(default)]
        time_zone: Option<String>,
    },

    /// Schedules of a parent that are active right now
    ActiveSchedules {
        parent_id: ParentId,
        #[serde(default)]
        time_zone: Option<String>,
    },

    /// Run one system-wide pass immediately
    RunPass,

    UpsertUser { user: User },

    CreateChild { child: NewChild },
    ListChildren { parent_id: ParentId },

    RegisterDevice { device: NewDevice },
    ListDevices { parent_id: ParentId },
    DeleteDevice {
        parent_id: ParentId,
        device_id: DeviceId,
    },
    SetConsent {
        device_id: DeviceId,
        status: ConsentStatus,
    },

    /// Create a schedule, optionally assigning it to devices
    CreateSchedule {
        schedule: NewSchedule,
        #[serde(default)]
        device_ids: Vec<DeviceId>,
    },
    UpdateSchedule {
        parent_id: ParentId,
        schedule_id: ScheduleId,
        update: ScheduleUpdate,
    },
    DeleteSchedule {
        parent_id: ParentId,
        schedule_id: ScheduleId,
    },
    ListSchedules { parent_id: ParentId },
    ListScheduleDevices {
        parent_id: ParentId,
        schedule_id: ScheduleId,
    },

    AssignSchedule {
        parent_id: ParentId,
        device_id: DeviceId,
        schedule_id: ScheduleId,
    },
    UnassignSchedule {
        parent_id: ParentId,
        device_id: DeviceId,
        schedule_id: ScheduleId,
    },

    /// Manual lock or unlock of one device
    SetDeviceLock {
        parent_id: ParentId,
        device_id: DeviceId,
        locked: bool,
    },
    /// Manual lock or unlock of every device the parent owns
    SetAllDevicesLock { parent_id: ParentId, locked: bool },
    /// Lock a device now and keep it locked for `duration_minutes`
    QuickLock {
        parent_id: ParentId,
        device_id: DeviceId,
        duration_minutes: u32,
    },

    RecentActivity {
        parent_id: ParentId,
        #[serde(default)]
        limit: Option<usize>,
    },
    DeviceActivity {
        parent_id: ParentId,
        device_id: DeviceId,
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Status polled by the companion app
    DeviceStatus { device_id: DeviceId },
    /// Companion status keyed by IMEI; one of the identifiers must match
    CompanionStatus {
        imei: String,
        #[serde(default)]
        identity: CompanionIdentity,
    },
    /// Find a registered device by its phone number
    LookupDevice { phone_number: String },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    /// Get health status
    GetHealth,

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Whether the command mutates stored state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Enforce { .. }
                | Command::RunPass
                | Command::UpsertUser { .. }
                | Command::CreateChild { .. }
                | Command::RegisterDevice { .. }
                | Command::DeleteDevice { .. }
                | Command::SetConsent { .. }
                | Command::CreateSchedule { .. }
                | Command::UpdateSchedule { .. }
                | Command::DeleteSchedule { .. }
                | Command::AssignSchedule { .. }
                | Command::UnassignSchedule { .. }
                | Command::SetDeviceLock { .. }
                | Command::SetAllDevicesLock { .. }
                | Command::QuickLock { .. }
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResponsePayload {
    Enforced(EnforcementSummary),
    BulkLock(BulkLockSummary),
    QuickLock(QuickLockSummary),
    Schedules(Vec<Schedule>),
    Schedule(Schedule),
    PassCompleted(PassReport),
    UserSaved,
    Child(Child),
    Children(Vec<Child>),
    Device(Device),
    Devices(Vec<Device>),
    Association(DeviceSchedule),
    Deleted,
    Activity(Vec<ActivityEntry>),
    DeviceStatus(DeviceStatusView),
    DeviceLookup(DeviceLookup),
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}
