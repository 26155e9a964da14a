//! Event types for curfewd -> client streaming

use chrono::{DateTime, Utc};
use curfew_util::DeviceId;
use serde::{Deserialize, Serialize};

use crate::{API_VERSION, ActivityAction, LoopState, PassReport};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: curfew_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A device's lock state was changed
    DeviceLockChanged {
        device_id: DeviceId,
        device_name: String,
        locked: bool,
        action: ActivityAction,
    },

    /// A periodic pass finished
    EnforcementPassCompleted(PassReport),

    /// The periodic driver started or stopped
    LoopStateChanged { state: LoopState },

    /// Service is shutting down
    Shutdown,
}
