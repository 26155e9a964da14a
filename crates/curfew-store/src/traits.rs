//! Store trait definitions

use curfew_api::{
    ActivityEntry, Child, ConsentStatus, Device, DeviceSchedule, NewActivity, NewChild, NewDevice,
    NewSchedule, Schedule, ScheduleUpdate, User,
};
use curfew_util::{ChildId, DeviceId, ParentId, ScheduleId};

use crate::StoreResult;

/// Main store trait
///
/// Every read returns the full current set. Nothing is cached between calls,
/// so each enforcement pass observes the latest committed state.
pub trait Store: Send + Sync {
    // Users

    /// Insert a user or refresh its profile fields
    fn upsert_user(&self, user: &User) -> StoreResult<()>;

    /// Ids of every known user
    fn list_user_ids(&self) -> StoreResult<Vec<ParentId>>;

    // Children

    fn create_child(&self, child: &NewChild) -> StoreResult<Child>;

    fn get_child(&self, id: ChildId) -> StoreResult<Option<Child>>;

    fn list_children_by_parent(&self, parent: &ParentId) -> StoreResult<Vec<Child>>;

    // Devices

    /// Register a device. IMEI and phone number (ignoring whitespace) must be
    /// unused, otherwise `StoreError::Conflict`.
    fn create_device(&self, device: &NewDevice) -> StoreResult<Device>;

    fn get_device(&self, id: DeviceId) -> StoreResult<Option<Device>>;

    fn get_device_by_imei(&self, imei: &str) -> StoreResult<Option<Device>>;

    /// Exact match first, then a whitespace-insensitive match
    fn get_device_by_phone_number(&self, phone_number: &str) -> StoreResult<Option<Device>>;

    /// Parent owning a device through its child
    fn device_owner(&self, id: DeviceId) -> StoreResult<Option<ParentId>>;

    /// Devices of every child belonging to `parent`
    fn list_devices_for_parent(&self, parent: &ParentId) -> StoreResult<Vec<Device>>;

    /// Write the lock flag and refresh `last_seen`
    fn set_device_locked(&self, id: DeviceId, locked: bool) -> StoreResult<Device>;

    /// Write the lock flag and append `entry` in one transaction, so a
    /// transition is never persisted without its log entry
    fn record_lock_change(
        &self,
        id: DeviceId,
        locked: bool,
        entry: &NewActivity,
    ) -> StoreResult<(Device, ActivityEntry)>;

    fn set_device_consent(&self, id: DeviceId, status: ConsentStatus) -> StoreResult<Device>;

    /// Delete a device together with its associations and activity
    fn delete_device(&self, id: DeviceId) -> StoreResult<()>;

    // Schedules

    fn create_schedule(&self, schedule: &NewSchedule) -> StoreResult<Schedule>;

    fn get_schedule(&self, id: ScheduleId) -> StoreResult<Option<Schedule>>;

    fn update_schedule(&self, id: ScheduleId, update: &ScheduleUpdate) -> StoreResult<Schedule>;

    /// Delete a schedule together with its associations
    fn delete_schedule(&self, id: ScheduleId) -> StoreResult<()>;

    fn list_schedules_by_parent(&self, parent: &ParentId) -> StoreResult<Vec<Schedule>>;

    /// Schedules currently assigned to a device
    fn list_schedules_for_device(&self, device: DeviceId) -> StoreResult<Vec<Schedule>>;

    // Associations

    /// Assign a schedule to a device. Assigning an existing pair returns the
    /// existing row.
    fn assign_device_schedule(
        &self,
        device: DeviceId,
        schedule: ScheduleId,
    ) -> StoreResult<DeviceSchedule>;

    /// Returns whether an association was removed
    fn unassign_device_schedule(&self, device: DeviceId, schedule: ScheduleId)
    -> StoreResult<bool>;

    /// Devices currently following a schedule
    fn list_devices_for_schedule(&self, schedule: ScheduleId) -> StoreResult<Vec<Device>>;

    // Activity log

    fn append_activity(&self, entry: &NewActivity) -> StoreResult<ActivityEntry>;

    /// Newest first, across every device the parent owns
    fn recent_activity_for_parent(
        &self,
        parent: &ParentId,
        limit: usize,
    ) -> StoreResult<Vec<ActivityEntry>>;

    /// Newest first
    fn activity_for_device(&self, device: DeviceId, limit: usize)
    -> StoreResult<Vec<ActivityEntry>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
