//! Per-device lock reconciliation

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use curfew_api::{ActivityAction, Device, NewActivity, Schedule};
use curfew_store::{Store, StoreResult};
use curfew_util::DeviceId;
use serde_json::json;
use tracing::{debug, info};

use crate::evaluator::active_schedules;

/// Which kind of pass is reconciling, recorded in the activity tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Requested by a parent for their own devices
    OnDemand,
    /// The background driver's sweep over every user
    Periodic,
}

impl EnforcementMode {
    pub fn action(self, locked: bool) -> ActivityAction {
        match (self, locked) {
            (EnforcementMode::OnDemand, true) => ActivityAction::ScheduleLock,
            (EnforcementMode::OnDemand, false) => ActivityAction::ScheduleUnlock,
            (EnforcementMode::Periodic, true) => ActivityAction::AutoScheduleLock,
            (EnforcementMode::Periodic, false) => ActivityAction::AutoScheduleUnlock,
        }
    }

    pub fn description(self, locked: bool) -> &'static str {
        match (self, locked) {
            (EnforcementMode::OnDemand, true) => {
                "Device automatically locked due to active schedule"
            }
            (EnforcementMode::OnDemand, false) => {
                "Device automatically unlocked - no active schedules"
            }
            (EnforcementMode::Periodic, true) => {
                "Device automatically locked by scheduled enforcement"
            }
            (EnforcementMode::Periodic, false) => {
                "Device automatically unlocked by scheduled enforcement"
            }
        }
    }
}

/// A lock-state transition that was written and logged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub device_id: DeviceId,
    pub device_name: String,
    pub locked: bool,
    pub action: ActivityAction,
}

/// Outcome of reconciling one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Lock state after reconciliation
    pub locked: bool,
    /// Set only when the state flipped
    pub change: Option<LockChange>,
}

impl Reconciliation {
    pub fn transitioned(&self) -> bool {
        self.change.is_some()
    }
}

/// Bring one device's lock state in line with its assigned schedules.
///
/// A device already in the right state is left untouched: no write, no log.
/// Otherwise the new state and exactly one activity entry are written
/// together.
pub fn reconcile(
    store: &dyn Store,
    device: &Device,
    schedules: &[Schedule],
    now: DateTime<Utc>,
    tz: Tz,
    mode: EnforcementMode,
) -> StoreResult<Reconciliation> {
    let active: Vec<_> = active_schedules(schedules, now, tz).map(|s| s.id).collect();
    let should_lock = !active.is_empty();

    if should_lock == device.is_locked {
        debug!(
            device_id = %device.id,
            locked = device.is_locked,
            schedules = schedules.len(),
            "Device already in expected state"
        );
        return Ok(Reconciliation {
            locked: device.is_locked,
            change: None,
        });
    }

    let action = mode.action(should_lock);
    let entry = NewActivity::new(device.id, action.clone(), mode.description(should_lock))
        .with_metadata(json!({
            "timeZone": tz.name(),
            "activeSchedules": active,
        }));
    store.record_lock_change(device.id, should_lock, &entry)?;

    info!(
        device_id = %device.id,
        device_name = %device.name,
        locked = should_lock,
        action = %action,
        "Device lock state reconciled"
    );

    Ok(Reconciliation {
        locked: should_lock,
        change: Some(LockChange {
            device_id: device.id,
            device_name: device.name.clone(),
            locked: should_lock,
            action,
        }),
    })
}
