//! Enforcement engine
//!
//! Owns the store and clock handles and exposes every operation the daemon
//! serves: enforcement passes, the active-schedule query, schedule and
//! device lifecycle, manual locking and activity queries.

use chrono_tz::Tz;
use curfew_api::{
    ActivityAction, ActivityEntry, BulkLockSummary, Child, CompanionIdentity, ConsentStatus,
    Device, DeviceLookup, DeviceSchedule, DeviceStatusView, EnforcementSummary, LockAction,
    LockUpdate, NewActivity, NewChild, NewDevice, NewSchedule, PassReport, QuickLockSummary,
    Schedule, ScheduleUpdate, User,
};
use curfew_store::{Store, StoreError};
use curfew_util::{
    Clock, DaysOfWeek, DeviceId, ParentId, ScheduleId, WallClock, local_day_and_time,
    weekday_index,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::evaluator::{active_schedules, is_schedule_active};
use crate::reconciler::{EnforcementMode, LockChange, reconcile};
use crate::{EngineError, EngineResult};

/// Entries returned when a caller does not ask for a specific count
pub const DEFAULT_ACTIVITY_LIMIT: usize = 10;

/// Placeholder IMEI of a device registered before its IMEI was known
pub const PENDING_IMEI: &str = "PENDING_IMEI_LOOKUP";

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Result of one system-wide pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub report: PassReport,
    pub changes: Vec<LockChange>,
}

/// The enforcement engine
pub struct EnforcementEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    default_zone: Tz,
}

impl EnforcementEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, default_zone: Tz) -> Self {
        info!(default_zone = %default_zone, "Enforcement engine initialized");
        Self {
            store,
            clock,
            default_zone,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn default_zone(&self) -> Tz {
        self.default_zone
    }

    /// Zone for a caller-supplied hint; absent or unknown hints use the default
    pub fn resolve_zone(&self, hint: Option<&str>) -> Tz {
        curfew_util::resolve_time_zone(hint, self.default_zone)
    }

    // Enforcement

    /// Reconcile every device of one parent. Store failures abort the pass
    /// and are returned to the caller.
    pub fn enforce_for_parent(
        &self,
        parent: &ParentId,
        time_zone: Option<&str>,
    ) -> EngineResult<(EnforcementSummary, Vec<LockChange>)> {
        let tz = self.resolve_zone(time_zone);
        let now = self.clock.now();
        let devices = self.store.list_devices_for_parent(parent)?;

        debug!(parent_id = %parent, devices = devices.len(), zone = %tz, "Starting on-demand enforcement");

        let mut updates = Vec::new();
        let mut changes = Vec::new();
        for device in &devices {
            let schedules = self.store.list_schedules_for_device(device.id)?;
            let result = reconcile(
                self.store.as_ref(),
                device,
                &schedules,
                now,
                tz,
                EnforcementMode::OnDemand,
            )?;

            if let Some(change) = result.change {
                updates.push(LockUpdate {
                    device_id: change.device_id,
                    action: LockAction::from_locked(change.locked),
                    device_name: change.device_name.clone(),
                });
                changes.push(change);
            }
        }

        info!(
            parent_id = %parent,
            total_devices = devices.len(),
            updated = updates.len(),
            "On-demand enforcement completed"
        );

        Ok((
            EnforcementSummary {
                message: "Schedule enforcement completed".into(),
                updates,
                total_devices: devices.len(),
            },
            changes,
        ))
    }

    /// Reconcile every device of every user in the default zone.
    ///
    /// Failures are isolated per device: they are logged and counted, and the
    /// pass moves on. Only a failure to list users aborts the pass.
    pub fn run_pass(&self) -> EngineResult<PassOutcome> {
        let started_at = self.clock.now();
        let tz = self.default_zone;
        let users = self.store.list_user_ids()?;

        let mut report = PassReport {
            started_at,
            users: users.len(),
            devices: 0,
            updated: 0,
            failed: 0,
        };
        let mut changes = Vec::new();

        for user in &users {
            let devices = match self.store.list_devices_for_parent(user) {
                Ok(devices) => devices,
                Err(e) => {
                    error!(parent_id = %user, error = %e, "Failed to list devices");
                    report.failed += 1;
                    continue;
                }
            };

            let mut user_updates = 0;
            for device in &devices {
                report.devices += 1;

                let result = self
                    .store
                    .list_schedules_for_device(device.id)
                    .and_then(|schedules| {
                        reconcile(
                            self.store.as_ref(),
                            device,
                            &schedules,
                            started_at,
                            tz,
                            EnforcementMode::Periodic,
                        )
                    });

                match result {
                    Ok(reconciliation) => {
                        if let Some(change) = reconciliation.change {
                            user_updates += 1;
                            changes.push(change);
                        }
                    }
                    Err(e) => {
                        error!(
                            parent_id = %user,
                            device_id = %device.id,
                            error = %e,
                            "Device reconciliation failed"
                        );
                        report.failed += 1;
                    }
                }
            }

            if user_updates > 0 {
                info!(parent_id = %user, updated = user_updates, "Updated devices for user");
            }
            report.updated += user_updates;
        }

        info!(
            users = report.users,
            devices = report.devices,
            updated = report.updated,
            failed = report.failed,
            "Periodic enforcement pass completed"
        );

        Ok(PassOutcome { report, changes })
    }

    /// Schedules of `parent` that are enabled and in effect right now
    pub fn active_schedules(
        &self,
        parent: &ParentId,
        time_zone: Option<&str>,
    ) -> EngineResult<Vec<Schedule>> {
        let tz = self.resolve_zone(time_zone);
        let now = self.clock.now();
        let schedules = self.store.list_schedules_by_parent(parent)?;

        Ok(active_schedules(&schedules, now, tz).cloned().collect())
    }

    // Users and children

    pub fn upsert_user(&self, user: &User) -> EngineResult<()> {
        self.store.upsert_user(user)?;
        Ok(())
    }

    pub fn create_child(&self, child: &NewChild) -> EngineResult<Child> {
        if child.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("child name cannot be empty".into()));
        }
        Ok(self.store.create_child(child)?)
    }

    pub fn list_children(&self, parent: &ParentId) -> EngineResult<Vec<Child>> {
        Ok(self.store.list_children_by_parent(parent)?)
    }

    // Devices

    pub fn register_device(&self, device: &NewDevice) -> EngineResult<Device> {
        if device.imei.trim().is_empty() {
            return Err(EngineError::InvalidInput("IMEI cannot be empty".into()));
        }
        if self.store.get_child(device.child_id)?.is_none() {
            return Err(EngineError::NotFound(format!("child {}", device.child_id)));
        }

        let created = self.store.create_device(device)?;
        self.store.append_activity(&NewActivity::new(
            created.id,
            ActivityAction::DeviceRegistered,
            format!("Device {} registered and awaiting consent", created.name),
        ))?;

        info!(device_id = %created.id, child_id = %created.child_id, "Device registered");
        Ok(created)
    }

    pub fn list_devices(&self, parent: &ParentId) -> EngineResult<Vec<Device>> {
        Ok(self.store.list_devices_for_parent(parent)?)
    }

    /// Delete a device with its associations and activity
    pub fn delete_device(&self, parent: &ParentId, device: DeviceId) -> EngineResult<()> {
        self.owned_device(parent, device)?;
        self.store.delete_device(device)?;
        info!(parent_id = %parent, device_id = %device, "Device deleted");
        Ok(())
    }

    pub fn set_consent(&self, device: DeviceId, status: ConsentStatus) -> EngineResult<Device> {
        let updated = match self.store.set_device_consent(device, status) {
            Err(StoreError::NotFound(_)) => {
                return Err(EngineError::NotFound(format!("device {device}")));
            }
            other => other?,
        };

        let action = match status {
            ConsentStatus::Approved => ActivityAction::ConsentApproved,
            ConsentStatus::Denied => ActivityAction::ConsentDenied,
            ConsentStatus::Pending => ActivityAction::Other("consent_updated".into()),
        };
        self.store.append_activity(&NewActivity::new(
            device,
            action,
            format!("Device consent status changed to {status}"),
        ))?;

        Ok(updated)
    }

    // Schedules

    pub fn list_schedules(&self, parent: &ParentId) -> EngineResult<Vec<Schedule>> {
        Ok(self.store.list_schedules_by_parent(parent)?)
    }

    /// Create a schedule and assign it to `devices`, logging each assignment
    pub fn create_schedule(
        &self,
        schedule: &NewSchedule,
        devices: &[DeviceId],
    ) -> EngineResult<Schedule> {
        if schedule.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("schedule name cannot be empty".into()));
        }
        for device in devices {
            self.owned_device(&schedule.parent_id, *device)?;
        }

        let created = self.store.create_schedule(schedule)?;
        for device in devices {
            self.store.assign_device_schedule(*device, created.id)?;
            self.store.append_activity(&NewActivity::new(
                *device,
                ActivityAction::ScheduleAssigned,
                format!("Schedule {} assigned to device", created.name),
            ))?;
        }

        info!(
            schedule_id = %created.id,
            parent_id = %created.parent_id,
            devices = devices.len(),
            "Schedule created"
        );
        Ok(created)
    }

    /// Apply an edit and log it on every device following the schedule
    pub fn update_schedule(
        &self,
        parent: &ParentId,
        schedule: ScheduleId,
        update: &ScheduleUpdate,
    ) -> EngineResult<Schedule> {
        self.owned_schedule(parent, schedule)?;
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(EngineError::InvalidInput("schedule name cannot be empty".into()));
        }

        let updated = self.store.update_schedule(schedule, update)?;
        for device in self.store.list_devices_for_schedule(schedule)? {
            self.store.append_activity(&NewActivity::new(
                device.id,
                ActivityAction::ScheduleUpdated,
                format!("Schedule {} updated", updated.name),
            ))?;
        }

        info!(schedule_id = %schedule, "Schedule updated");
        Ok(updated)
    }

    /// Delete a schedule. Followers are logged before the associations go.
    pub fn delete_schedule(&self, parent: &ParentId, schedule: ScheduleId) -> EngineResult<()> {
        let existing = self.owned_schedule(parent, schedule)?;

        let followers = self.store.list_devices_for_schedule(schedule)?;
        for device in &followers {
            self.store.append_activity(&NewActivity::new(
                device.id,
                ActivityAction::ScheduleDeleted,
                format!("Schedule {} deleted", existing.name),
            ))?;
        }

        self.store.delete_schedule(schedule)?;
        info!(schedule_id = %schedule, followers = followers.len(), "Schedule deleted");
        Ok(())
    }

    pub fn schedule_devices(
        &self,
        parent: &ParentId,
        schedule: ScheduleId,
    ) -> EngineResult<Vec<Device>> {
        self.owned_schedule(parent, schedule)?;
        Ok(self.store.list_devices_for_schedule(schedule)?)
    }

    /// Assign a schedule to a device; repeating an assignment is harmless
    pub fn assign_schedule(
        &self,
        parent: &ParentId,
        device: DeviceId,
        schedule: ScheduleId,
    ) -> EngineResult<DeviceSchedule> {
        let existing = self.owned_schedule(parent, schedule)?;
        self.owned_device(parent, device)?;

        let association = self.store.assign_device_schedule(device, schedule)?;
        self.store.append_activity(&NewActivity::new(
            device,
            ActivityAction::ScheduleAssigned,
            format!("Device assigned to schedule: {}", existing.name),
        ))?;

        debug!(device_id = %device, schedule_id = %schedule, "Schedule assigned");
        Ok(association)
    }

    pub fn unassign_schedule(
        &self,
        parent: &ParentId,
        device: DeviceId,
        schedule: ScheduleId,
    ) -> EngineResult<()> {
        let existing = self.owned_schedule(parent, schedule)?;
        self.owned_device(parent, device)?;

        if !self.store.unassign_device_schedule(device, schedule)? {
            return Err(EngineError::NotFound(format!(
                "schedule {schedule} is not assigned to device {device}"
            )));
        }
        self.store.append_activity(&NewActivity::new(
            device,
            ActivityAction::ScheduleUnassigned,
            format!("Device removed from schedule: {}", existing.name),
        ))?;

        debug!(device_id = %device, schedule_id = %schedule, "Schedule unassigned");
        Ok(())
    }

    // Manual locking

    /// Lock or unlock one device on a parent's request. The next
    /// enforcement pass may override it.
    pub fn set_device_lock(
        &self,
        parent: &ParentId,
        device: DeviceId,
        locked: bool,
    ) -> EngineResult<(Device, Option<LockChange>)> {
        let current = self.owned_device(parent, device)?;
        let action = manual_action(locked);
        let (updated, _) = self.store.record_lock_change(
            device,
            locked,
            &manual_activity(&current, locked, action.clone()),
        )?;

        info!(device_id = %device, locked, "Device manually {}", lock_word(locked));

        let change = (current.is_locked != locked).then(|| LockChange {
            device_id: device,
            device_name: current.name.clone(),
            locked,
            action,
        });
        Ok((updated, change))
    }

    /// Lock or unlock every device of a parent. Only devices whose state
    /// differs are written; every device gets a log entry.
    pub fn set_all_devices_lock(
        &self,
        parent: &ParentId,
        locked: bool,
    ) -> EngineResult<(BulkLockSummary, Vec<LockChange>)> {
        let devices = self.store.list_devices_for_parent(parent)?;
        let action = manual_action(locked);
        let mut changes = Vec::new();

        for device in &devices {
            let entry = manual_activity(device, locked, action.clone());
            if device.is_locked == locked {
                self.store.append_activity(&entry)?;
                continue;
            }

            self.store.record_lock_change(device.id, locked, &entry)?;
            changes.push(LockChange {
                device_id: device.id,
                device_name: device.name.clone(),
                locked,
                action: action.clone(),
            });
        }

        info!(
            parent_id = %parent,
            total_devices = devices.len(),
            affected = changes.len(),
            "All devices manually {}",
            lock_word(locked)
        );

        let verb = if locked { "Locked" } else { "Unlocked" };
        Ok((
            BulkLockSummary {
                message: format!("{verb} {} device(s)", devices.len()),
                action: LockAction::from_locked(locked),
                affected_devices: changes.len(),
                total_devices: devices.len(),
            },
            changes,
        ))
    }

    /// Lock a device now and keep it locked for `duration_minutes`.
    ///
    /// The lock is backed by a temporary schedule on today's weekday in the
    /// default zone, so enforcement passes inside the window keep it. A
    /// window running past midnight ends at midnight like any other
    /// single-day schedule.
    pub fn quick_lock(
        &self,
        parent: &ParentId,
        device: DeviceId,
        duration_minutes: u32,
    ) -> EngineResult<(QuickLockSummary, Option<LockChange>)> {
        if duration_minutes == 0 || duration_minutes >= MINUTES_PER_DAY {
            return Err(EngineError::InvalidInput(format!(
                "quick lock duration must be between 1 and {} minutes",
                MINUTES_PER_DAY - 1
            )));
        }
        let current = self.owned_device(parent, device)?;

        let (weekday, start) = local_day_and_time(self.clock.now(), self.default_zone);
        let end_minutes =
            (u32::from(start.minutes_from_midnight()) + duration_minutes) % MINUTES_PER_DAY;
        let end = WallClock::new((end_minutes / 60) as u8, (end_minutes % 60) as u8)
            .ok_or_else(|| EngineError::InvalidInput(format!("no wall time at minute {end_minutes}")))?;

        let schedule = self.store.create_schedule(&NewSchedule {
            parent_id: parent.clone(),
            name: format!("Quick Lock - {duration_minutes}min"),
            start_time: start,
            end_time: end,
            days_of_week: DaysOfWeek::from_indices([weekday_index(weekday)]),
            is_active: true,
        })?;
        self.store.assign_device_schedule(device, schedule.id)?;

        let entry = NewActivity::new(
            device,
            ActivityAction::QuickLock,
            format!("Device locked for {duration_minutes} minutes"),
        )
        .with_metadata(json!({
            "duration": duration_minutes,
            "scheduleId": schedule.id,
        }));
        self.store.record_lock_change(device, true, &entry)?;

        info!(
            device_id = %device,
            schedule_id = %schedule.id,
            duration_minutes,
            until = %end,
            "Device quick-locked"
        );

        let change = (!current.is_locked).then(|| LockChange {
            device_id: device,
            device_name: current.name.clone(),
            locked: true,
            action: ActivityAction::QuickLock,
        });
        Ok((
            QuickLockSummary {
                message: "Device locked successfully".into(),
                duration_minutes,
                schedule_id: schedule.id,
                until: end,
            },
            change,
        ))
    }

    // Activity and status

    /// Newest first across every device of the parent
    pub fn recent_activity(
        &self,
        parent: &ParentId,
        limit: Option<usize>,
    ) -> EngineResult<Vec<ActivityEntry>> {
        let limit = limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
        Ok(self.store.recent_activity_for_parent(parent, limit)?)
    }

    pub fn device_activity(
        &self,
        parent: &ParentId,
        device: DeviceId,
        limit: Option<usize>,
    ) -> EngineResult<Vec<ActivityEntry>> {
        self.owned_device(parent, device)?;
        let limit = limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
        Ok(self.store.activity_for_device(device, limit)?)
    }

    /// Read-only status for the companion app, evaluated in the default zone
    pub fn device_status(&self, device: DeviceId) -> EngineResult<DeviceStatusView> {
        let found = self
            .store
            .get_device(device)?
            .ok_or_else(|| EngineError::NotFound(format!("device {device}")))?;
        self.status_view(found)
    }

    /// Status for a companion identifying itself by IMEI.
    ///
    /// Either the phone number (ignoring whitespace) or the fingerprint must
    /// match the registration. The fingerprint is compared to the stored
    /// fingerprint, or to the IMEI when none was stored. Both outcomes are
    /// logged; a mismatch is `Forbidden`.
    pub fn companion_status(
        &self,
        imei: &str,
        identity: &CompanionIdentity,
    ) -> EngineResult<DeviceStatusView> {
        let device = self
            .store
            .get_device_by_imei(imei)?
            .ok_or_else(|| EngineError::NotFound(format!("device with IMEI {imei}")))?;

        let phone_matches = identity
            .phone_number
            .as_deref()
            .map(without_whitespace)
            .is_some_and(|p| !p.is_empty() && p == without_whitespace(&device.phone_number));
        let fingerprint_matches = identity.device_fingerprint.as_deref().is_some_and(|f| {
            f == device.device_fingerprint.as_deref().unwrap_or(&device.imei)
        });

        if !phone_matches && !fingerprint_matches {
            self.store.append_activity(
                &NewActivity::new(
                    device.id,
                    ActivityAction::SecurityAlert,
                    "Device validation failed - neither phone number nor IMEI match",
                )
                .with_metadata(json!({
                    "attemptedPhone": identity.phone_number,
                    "attemptedFingerprint": identity.device_fingerprint,
                    "phoneMatches": false,
                    "imeiMatches": false,
                })),
            )?;
            warn!(device_id = %device.id, "Companion identity mismatch");
            return Err(EngineError::Forbidden(format!(
                "device {} identity mismatch",
                device.id
            )));
        }

        let method = match (phone_matches, fingerprint_matches) {
            (true, true) => "both",
            (true, false) => "phone",
            _ => "imei",
        };
        self.store.append_activity(
            &NewActivity::new(
                device.id,
                ActivityAction::DeviceValidated,
                format!("Device access granted - {method} match"),
            )
            .with_metadata(json!({
                "validationMethod": method,
                "phoneMatches": phone_matches,
                "imeiMatches": fingerprint_matches,
            })),
        )?;

        self.status_view(device)
    }

    /// Registered device for a phone number. Devices still waiting for an
    /// IMEI are reported as not found.
    pub fn lookup_device(&self, phone_number: &str) -> EngineResult<DeviceLookup> {
        let device = self
            .store
            .get_device_by_phone_number(phone_number)?
            .filter(|d| d.imei != PENDING_IMEI)
            .ok_or_else(|| {
                EngineError::NotFound(format!("device with phone number {phone_number}"))
            })?;

        self.store.append_activity(
            &NewActivity::new(
                device.id,
                ActivityAction::ImeiLookup,
                format!("IMEI lookup performed for mobile number {phone_number}"),
            )
            .with_metadata(json!({ "phoneNumber": phone_number, "imei": device.imei })),
        )?;

        Ok(DeviceLookup {
            device_id: device.id,
            device_name: device.name,
            imei: device.imei,
            phone_number: device.phone_number,
            is_active: device.is_active,
            is_locked: device.is_locked,
            consent_status: device.consent_status,
        })
    }

    fn status_view(&self, device: Device) -> EngineResult<DeviceStatusView> {
        let now = self.clock.now();
        let active = self
            .store
            .list_schedules_for_device(device.id)?
            .into_iter()
            .filter(|s| is_schedule_active(s, now, self.default_zone))
            .collect();

        Ok(DeviceStatusView {
            device_id: device.id,
            name: device.name,
            is_locked: device.is_locked,
            consent_status: device.consent_status,
            last_seen: device.last_seen,
            active_schedules: active,
        })
    }

    pub fn is_store_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    // Ownership checks

    fn owned_device(&self, parent: &ParentId, device: DeviceId) -> EngineResult<Device> {
        let found = self
            .store
            .get_device(device)?
            .ok_or_else(|| EngineError::NotFound(format!("device {device}")))?;

        match self.store.device_owner(device)? {
            Some(owner) if &owner == parent => Ok(found),
            _ => {
                warn!(parent_id = %parent, device_id = %device, "Device belongs to another parent");
                Err(EngineError::Forbidden(format!("device {device}")))
            }
        }
    }

    fn owned_schedule(&self, parent: &ParentId, schedule: ScheduleId) -> EngineResult<Schedule> {
        let found = self
            .store
            .get_schedule(schedule)?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule}")))?;

        if &found.parent_id != parent {
            warn!(parent_id = %parent, schedule_id = %schedule, "Schedule belongs to another parent");
            return Err(EngineError::Forbidden(format!("schedule {schedule}")));
        }
        Ok(found)
    }
}

fn manual_action(locked: bool) -> ActivityAction {
    if locked {
        ActivityAction::ManualLock
    } else {
        ActivityAction::ManualUnlock
    }
}

fn without_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn lock_word(locked: bool) -> &'static str {
    if locked { "locked" } else { "unlocked" }
}

fn manual_activity(device: &Device, locked: bool, action: ActivityAction) -> NewActivity {
    NewActivity::new(
        device.id,
        action,
        format!("Device manually {} by parent", lock_word(locked)),
    )
    .with_metadata(json!({
        "lockType": "manual",
        "previousState": lock_word(device.is_locked),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use curfew_store::SqliteStore;
    use curfew_util::{DaysOfWeek, FixedClock, WallClock};

    struct Fixture {
        engine: EnforcementEngine,
        clock: Arc<FixedClock>,
        parent: ParentId,
        device: Device,
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn add_parent(store: &SqliteStore, id: &str, imei: &str) -> (ParentId, Device) {
        let parent = ParentId::new(id);
        store
            .upsert_user(&User {
                id: parent.clone(),
                email: None,
                display_name: None,
            })
            .unwrap();
        let child = store
            .create_child(&NewChild {
                parent_id: parent.clone(),
                name: "Kid".into(),
                age: None,
            })
            .unwrap();
        let device = store
            .create_device(&NewDevice {
                child_id: child.id,
                name: format!("{id} phone"),
                imei: imei.into(),
                phone_number: imei.into(),
                device_fingerprint: None,
            })
            .unwrap();
        (parent, device)
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::at("2024-01-01T22:05:00Z"));
        let store = SqliteStore::in_memory().unwrap().with_clock(clock.clone());
        let (parent, device) = add_parent(&store, "parent", "111");
        let engine = EnforcementEngine::new(Arc::new(store), clock.clone(), chrono_tz::UTC);
        Fixture {
            engine,
            clock,
            parent,
            device,
        }
    }

    fn bedtime(parent: &ParentId) -> NewSchedule {
        NewSchedule {
            parent_id: parent.clone(),
            name: "Bedtime".into(),
            start_time: WallClock::parse("22:00").unwrap(),
            end_time: WallClock::parse("06:30").unwrap(),
            days_of_week: DaysOfWeek::from_indices([1]),
            is_active: true,
        }
    }

    #[test]
    fn test_enforce_locks_and_summarises() {
        let f = fixture();
        f.engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();

        let (summary, changes) = f.engine.enforce_for_parent(&f.parent, Some("UTC")).unwrap();
        assert_eq!(summary.message, "Schedule enforcement completed");
        assert_eq!(summary.total_devices, 1);
        assert_eq!(summary.updates.len(), 1);
        assert_eq!(summary.updates[0].action, LockAction::Locked);
        assert_eq!(summary.updates[0].device_name, "parent phone");
        assert_eq!(changes[0].action, ActivityAction::ScheduleLock);

        let (again, _) = f.engine.enforce_for_parent(&f.parent, Some("UTC")).unwrap();
        assert!(again.updates.is_empty());
    }

    #[test]
    fn test_enforce_uses_time_zone_hint() {
        let f = fixture();
        f.engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();

        // 22:05 UTC Monday is 03:35 Tuesday in Kolkata
        let (summary, _) = f
            .engine
            .enforce_for_parent(&f.parent, Some("Asia/Kolkata"))
            .unwrap();
        assert!(summary.updates.is_empty());

        // Unknown hint falls back to the engine default (UTC here)
        let (summary, _) = f
            .engine
            .enforce_for_parent(&f.parent, Some("Not/AZone"))
            .unwrap();
        assert_eq!(summary.updates.len(), 1);
    }

    #[test]
    fn test_run_pass_covers_all_users() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (alice, alice_device) = add_parent(&store, "alice", "111");
        let (bob, bob_device) = add_parent(&store, "bob", "222");
        let clock = Arc::new(FixedClock::at("2024-01-01T22:05:00Z"));
        let engine = EnforcementEngine::new(store.clone(), clock.clone(), chrono_tz::UTC);

        engine.create_schedule(&bedtime(&alice), &[alice_device.id]).unwrap();
        engine.create_schedule(&bedtime(&bob), &[bob_device.id]).unwrap();

        let outcome = engine.run_pass().unwrap();
        assert_eq!(outcome.report.users, 2);
        assert_eq!(outcome.report.devices, 2);
        assert_eq!(outcome.report.updated, 2);
        assert_eq!(outcome.report.failed, 0);
        assert!(
            outcome
                .changes
                .iter()
                .all(|c| c.action == ActivityAction::AutoScheduleLock)
        );

        // Tuesday 05:00: Monday-only schedule no longer applies
        clock.set(at("2024-01-02T05:00:00Z"));
        let outcome = engine.run_pass().unwrap();
        assert_eq!(outcome.report.updated, 2);
        assert!(!store.get_device(alice_device.id).unwrap().unwrap().is_locked);
    }

    #[test]
    fn test_run_pass_isolates_device_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curfew.db");
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let (alice, alice_device) = add_parent(&store, "alice", "111");
        let (bob, bob_device) = add_parent(&store, "bob", "222");
        let clock = Arc::new(FixedClock::at("2024-01-01T22:05:00Z"));
        let engine = EnforcementEngine::new(store.clone(), clock, chrono_tz::UTC);

        let broken = engine.create_schedule(&bedtime(&alice), &[alice_device.id]).unwrap();
        engine.create_schedule(&bedtime(&bob), &[bob_device.id]).unwrap();

        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE schedules SET start_time = 'bad' WHERE id = ?1",
            [broken.id.get()],
        )
        .unwrap();

        let outcome = engine.run_pass().unwrap();
        assert_eq!(outcome.report.devices, 2);
        assert_eq!(outcome.report.failed, 1);
        assert_eq!(outcome.report.updated, 1);
        assert_eq!(outcome.changes[0].device_id, bob_device.id);
        assert!(!store.get_device(alice_device.id).unwrap().unwrap().is_locked);
    }

    #[test]
    fn test_active_schedules_query() {
        let f = fixture();
        let bedtime = f.engine.create_schedule(&bedtime(&f.parent), &[]).unwrap();
        let mut homework = NewSchedule {
            name: "Homework".into(),
            start_time: WallClock::parse("16:00").unwrap(),
            end_time: WallClock::parse("18:00").unwrap(),
            ..self::bedtime(&f.parent)
        };
        f.engine.create_schedule(&homework, &[]).unwrap();
        homework.is_active = false;
        homework.start_time = WallClock::parse("22:00").unwrap();
        homework.end_time = WallClock::parse("23:00").unwrap();
        f.engine.create_schedule(&homework, &[]).unwrap();

        let active = f.engine.active_schedules(&f.parent, Some("UTC")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, bedtime.id);
    }

    #[test]
    fn test_delete_schedule_logs_then_cascades() {
        let f = fixture();
        let schedule = f
            .engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();
        f.engine.enforce_for_parent(&f.parent, None).unwrap();

        f.engine.delete_schedule(&f.parent, schedule.id).unwrap();

        let log = f.engine.recent_activity(&f.parent, None).unwrap();
        assert_eq!(log[0].action, ActivityAction::ScheduleDeleted);
        assert!(
            f.engine
                .store()
                .list_schedules_for_device(f.device.id)
                .unwrap()
                .is_empty()
        );

        let (summary, _) = f.engine.enforce_for_parent(&f.parent, None).unwrap();
        assert_eq!(summary.updates[0].action, LockAction::Unlocked);
    }

    #[test]
    fn test_ownership_is_enforced() {
        let f = fixture();
        let schedule = f.engine.create_schedule(&bedtime(&f.parent), &[]).unwrap();
        let stranger = ParentId::new("stranger");

        assert!(matches!(
            f.engine.delete_schedule(&stranger, schedule.id),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            f.engine.assign_schedule(&stranger, f.device.id, schedule.id),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            f.engine.delete_schedule(&f.parent, ScheduleId::new(404)),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            f.engine.set_device_lock(&f.parent, DeviceId::new(404), true),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_assign_twice_keeps_one_association() {
        let f = fixture();
        let schedule = f.engine.create_schedule(&bedtime(&f.parent), &[]).unwrap();

        let first = f
            .engine
            .assign_schedule(&f.parent, f.device.id, schedule.id)
            .unwrap();
        let second = f
            .engine
            .assign_schedule(&f.parent, f.device.id, schedule.id)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            f.engine
                .schedule_devices(&f.parent, schedule.id)
                .unwrap()
                .len(),
            1
        );

        f.engine
            .unassign_schedule(&f.parent, f.device.id, schedule.id)
            .unwrap();
        assert!(matches!(
            f.engine.unassign_schedule(&f.parent, f.device.id, schedule.id),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_schedule_logs_on_followers() {
        let f = fixture();
        let schedule = f
            .engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();

        let updated = f
            .engine
            .update_schedule(
                &f.parent,
                schedule.id,
                &ScheduleUpdate {
                    name: Some("Lights out".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Lights out");

        let log = f.engine.device_activity(&f.parent, f.device.id, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::ScheduleUpdated);
        assert_eq!(log[0].description, "Schedule Lights out updated");
    }

    #[test]
    fn test_manual_lock_is_overridden_by_next_pass() {
        let f = fixture();
        f.clock.set(at("2024-01-01T12:00:00Z"));

        let (device, change) = f.engine.set_device_lock(&f.parent, f.device.id, true).unwrap();
        assert!(device.is_locked);
        assert_eq!(change.map(|c| c.action), Some(ActivityAction::ManualLock));

        let log = f.engine.recent_activity(&f.parent, None).unwrap();
        let meta = log[0].metadata.as_ref().unwrap();
        assert_eq!(meta["lockType"], "manual");
        assert_eq!(meta["previousState"], "unlocked");

        let outcome = f.engine.run_pass().unwrap();
        assert_eq!(outcome.report.updated, 1);
        assert_eq!(outcome.changes[0].action, ActivityAction::AutoScheduleUnlock);
    }

    #[test]
    fn test_bulk_lock_logs_every_device() {
        let f = fixture();
        f.engine.set_device_lock(&f.parent, f.device.id, true).unwrap();

        let (summary, changes) = f.engine.set_all_devices_lock(&f.parent, true).unwrap();
        assert_eq!(summary.total_devices, 1);
        assert_eq!(summary.affected_devices, 0);
        assert_eq!(summary.message, "Locked 1 device(s)");
        assert!(changes.is_empty());

        let log = f.engine.recent_activity(&f.parent, None).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].metadata.as_ref().unwrap()["previousState"], "locked");
    }

    #[test]
    fn test_device_status_reports_active_schedules() {
        let f = fixture();
        f.engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();

        let status = f.engine.device_status(f.device.id).unwrap();
        assert_eq!(status.active_schedules.len(), 1);
        assert!(!status.is_locked);

        f.clock.set(at("2024-01-01T12:00:00Z"));
        assert!(f.engine.device_status(f.device.id).unwrap().active_schedules.is_empty());
    }

    #[test]
    fn test_register_device_logs_registration() {
        let f = fixture();
        let child = f.engine.list_children(&f.parent).unwrap().remove(0);

        let device = f
            .engine
            .register_device(&NewDevice {
                child_id: child.id,
                name: "Laptop".into(),
                imei: "333".into(),
                phone_number: "+1 555 0199".into(),
                device_fingerprint: Some("fp".into()),
            })
            .unwrap();

        let log = f.engine.device_activity(&f.parent, device.id, None).unwrap();
        assert_eq!(log[0].action, ActivityAction::DeviceRegistered);

        let approved = f.engine.set_consent(device.id, ConsentStatus::Approved).unwrap();
        assert_eq!(approved.consent_status, ConsentStatus::Approved);
    }

    #[test]
    fn test_activity_is_stamped_with_engine_clock() {
        let f = fixture();
        f.engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(3));

        f.engine.enforce_for_parent(&f.parent, None).unwrap();

        let log = f.engine.recent_activity(&f.parent, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::ScheduleLock);
        assert_eq!(log[0].timestamp, at("2024-01-01T22:08:00Z"));
        let device = f.engine.device_status(f.device.id).unwrap();
        assert_eq!(device.last_seen, Some(at("2024-01-01T22:08:00Z")));
    }

    #[test]
    fn test_quick_lock_holds_until_window_ends() {
        let f = fixture();
        f.clock.set(at("2024-01-03T14:10:00Z"));

        let (summary, change) = f.engine.quick_lock(&f.parent, f.device.id, 30).unwrap();
        assert_eq!(summary.message, "Device locked successfully");
        assert_eq!(summary.until.to_string(), "14:40");
        assert_eq!(change.map(|c| c.action), Some(ActivityAction::QuickLock));

        let log = f.engine.recent_activity(&f.parent, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::QuickLock);
        assert_eq!(log[0].description, "Device locked for 30 minutes");
        let meta = log[0].metadata.as_ref().unwrap();
        assert_eq!(meta["duration"], 30);
        assert_eq!(meta["scheduleId"], summary.schedule_id.get());

        let schedules = f.engine.list_schedules(&f.parent).unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].name, "Quick Lock - 30min");
        assert_eq!(schedules[0].days_of_week.indices(), vec![3]);

        // Inside the window the pass keeps the lock
        f.clock.set(at("2024-01-03T14:30:00Z"));
        let outcome = f.engine.run_pass().unwrap();
        assert_eq!(outcome.report.updated, 0);
        assert!(f.engine.device_status(f.device.id).unwrap().is_locked);

        f.clock.set(at("2024-01-03T14:41:00Z"));
        let outcome = f.engine.run_pass().unwrap();
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].action, ActivityAction::AutoScheduleUnlock);
    }

    #[test]
    fn test_quick_lock_validation() {
        let f = fixture();
        assert!(matches!(
            f.engine.quick_lock(&f.parent, f.device.id, 0),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            f.engine.quick_lock(&f.parent, f.device.id, 24 * 60),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            f.engine.quick_lock(&ParentId::new("stranger"), f.device.id, 15),
            Err(EngineError::Forbidden(_))
        ));
        assert!(f.engine.list_schedules(&f.parent).unwrap().is_empty());
    }

    #[test]
    fn test_companion_status_checks_identity() {
        let f = fixture();
        f.engine
            .create_schedule(&bedtime(&f.parent), &[f.device.id])
            .unwrap();

        let by_phone = CompanionIdentity {
            phone_number: Some(" 1 11 ".into()),
            device_fingerprint: None,
        };
        let status = f.engine.companion_status("111", &by_phone).unwrap();
        assert_eq!(status.device_id, f.device.id);
        assert_eq!(status.active_schedules.len(), 1);

        let log = f.engine.device_activity(&f.parent, f.device.id, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::DeviceValidated);
        assert_eq!(log[0].metadata.as_ref().unwrap()["validationMethod"], "phone");

        // Without a stored fingerprint the IMEI stands in for it
        let by_imei = CompanionIdentity {
            phone_number: None,
            device_fingerprint: Some("111".into()),
        };
        assert!(f.engine.companion_status("111", &by_imei).is_ok());

        let stranger = CompanionIdentity {
            phone_number: Some("999".into()),
            device_fingerprint: Some("other".into()),
        };
        assert!(matches!(
            f.engine.companion_status("111", &stranger),
            Err(EngineError::Forbidden(_))
        ));
        let log = f.engine.device_activity(&f.parent, f.device.id, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::SecurityAlert);

        assert!(matches!(
            f.engine.companion_status("404", &by_phone),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_lookup_device_by_phone_number() {
        let f = fixture();
        let child = f.engine.list_children(&f.parent).unwrap().remove(0);
        f.engine
            .register_device(&NewDevice {
                child_id: child.id,
                name: "New phone".into(),
                imei: PENDING_IMEI.into(),
                phone_number: "+91 98765 43210".into(),
                device_fingerprint: None,
            })
            .unwrap();

        let found = f.engine.lookup_device("111").unwrap();
        assert_eq!(found.device_id, f.device.id);
        assert_eq!(found.imei, "111");
        let log = f.engine.device_activity(&f.parent, f.device.id, Some(1)).unwrap();
        assert_eq!(log[0].action, ActivityAction::ImeiLookup);

        assert!(matches!(
            f.engine.lookup_device("+91 98765 43210"),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            f.engine.lookup_device("000"),
            Err(EngineError::NotFound(_))
        ));
    }
}
