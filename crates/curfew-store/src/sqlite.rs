//! SQLite-based store implementation

use curfew_api::{
    ActivityEntry, Child, ConsentStatus, Device, DeviceSchedule, NewActivity, NewChild, NewDevice,
    NewSchedule, Schedule, ScheduleUpdate, User,
};
use curfew_util::{ChildId, Clock, DeviceId, ParentId, ScheduleId, SystemClock};
use rusqlite::{Connection, OptionalExtension, Params, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::rows::{
    ACTIVITY_COLUMNS, ActivityRow, AssociationRow, CHILD_COLUMNS, ChildRow, DEVICE_COLUMNS,
    DeviceRow, SCHEDULE_COLUMNS, ScheduleRow, format_timestamp, phone_key,
};
use crate::{Store, StoreError, StoreResult};

/// SQLite-based store
///
/// Row timestamps (`created_at`, `last_seen`, activity `timestamp`) come from
/// the store's clock, the system clock unless [`with_clock`](Self::with_clock)
/// says otherwise.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Stamp rows with `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stamp(&self) -> String {
        format_timestamp(self.clock.now())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT,
                display_name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS children (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                age INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                child_id INTEGER NOT NULL REFERENCES children(id),
                name TEXT NOT NULL,
                imei TEXT NOT NULL UNIQUE,
                phone_number TEXT NOT NULL,
                phone_key TEXT NOT NULL UNIQUE,
                is_locked INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_seen TEXT,
                consent_status TEXT NOT NULL DEFAULT 'pending',
                device_fingerprint TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                days_of_week TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                schedule_id INTEGER NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                UNIQUE (device_id, schedule_id)
            );

            -- Activity log (append-only)
            CREATE TABLE IF NOT EXISTS activity_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                description TEXT NOT NULL,
                metadata TEXT,
                timestamp TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_children_parent ON children(parent_id);
            CREATE INDEX IF NOT EXISTS idx_devices_child ON devices(child_id);
            CREATE INDEX IF NOT EXISTS idx_schedules_parent ON schedules(parent_id);
            CREATE INDEX IF NOT EXISTS idx_device_schedules_schedule ON device_schedules(schedule_id);
            CREATE INDEX IF NOT EXISTS idx_activity_device_time ON activity_logs(device_id, timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn query_devices(conn: &Connection, sql: &str, params: impl Params) -> StoreResult<Vec<Device>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, DeviceRow::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(DeviceRow::into_device))
        .collect()
}

fn query_device(conn: &Connection, sql: &str, params: impl Params) -> StoreResult<Option<Device>> {
    conn.query_row(sql, params, DeviceRow::from_row)
        .optional()?
        .map(DeviceRow::into_device)
        .transpose()
}

fn query_schedules(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> StoreResult<Vec<Schedule>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ScheduleRow::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(ScheduleRow::into_schedule))
        .collect()
}

fn query_activity(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> StoreResult<Vec<ActivityEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ActivityRow::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(ActivityRow::into_entry))
        .collect()
}

fn device_by_id(conn: &Connection, id: DeviceId) -> StoreResult<Option<Device>> {
    query_device(
        conn,
        &format!("SELECT {DEVICE_COLUMNS} FROM devices d WHERE d.id = ?"),
        [id.get()],
    )
}

fn schedule_by_id(conn: &Connection, id: ScheduleId) -> StoreResult<Option<Schedule>> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules s WHERE s.id = ?"),
        [id.get()],
        ScheduleRow::from_row,
    )
    .optional()?
    .map(ScheduleRow::into_schedule)
    .transpose()
}

fn require_device(conn: &Connection, id: DeviceId) -> StoreResult<Device> {
    device_by_id(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("device {id}")))
}

fn write_lock(conn: &Connection, id: DeviceId, locked: bool, at: &str) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE devices SET is_locked = ?, last_seen = ? WHERE id = ?",
        params![locked, at, id.get()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("device {id}")));
    }

    debug!(device_id = %id, locked, "Device lock state written");
    Ok(())
}

fn insert_activity(conn: &Connection, entry: &NewActivity, at: &str) -> StoreResult<ActivityEntry> {
    let metadata = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO activity_logs (device_id, action, description, metadata, timestamp) \
         VALUES (?, ?, ?, ?, ?)",
        params![
            entry.device_id.get(),
            entry.action.as_str(),
            entry.description,
            metadata,
            at
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(activity_id = id, device_id = %entry.device_id, action = %entry.action, "Activity appended");

    conn.query_row(
        &format!("SELECT {ACTIVITY_COLUMNS} FROM activity_logs a WHERE a.id = ?"),
        [id],
        ActivityRow::from_row,
    )?
    .into_entry()
}

impl Store for SqliteStore {
    fn upsert_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO users (id, email, display_name, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id)
            DO UPDATE SET email = excluded.email, display_name = excluded.display_name
            "#,
            params![
                user.id.as_str(),
                user.email,
                user.display_name,
                self.stamp()
            ],
        )?;

        debug!(user_id = %user.id, "User upserted");
        Ok(())
    }

    fn list_user_ids(&self) -> StoreResult<Vec<ParentId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY created_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|id| id.map(ParentId::new))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn create_child(&self, child: &NewChild) -> StoreResult<Child> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO children (parent_id, name, age, created_at) VALUES (?, ?, ?, ?)",
            params![
                child.parent_id.as_str(),
                child.name,
                child.age,
                self.stamp()
            ],
        )?;
        let id = conn.last_insert_rowid();

        conn.query_row(
            &format!("SELECT {CHILD_COLUMNS} FROM children c WHERE c.id = ?"),
            [id],
            ChildRow::from_row,
        )?
        .into_child()
    }

    fn get_child(&self, id: ChildId) -> StoreResult<Option<Child>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CHILD_COLUMNS} FROM children c WHERE c.id = ?"),
            [id.get()],
            ChildRow::from_row,
        )
        .optional()?
        .map(ChildRow::into_child)
        .transpose()
    }

    fn list_children_by_parent(&self, parent: &ParentId) -> StoreResult<Vec<Child>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHILD_COLUMNS} FROM children c WHERE c.parent_id = ? ORDER BY c.id"
        ))?;
        let rows = stmt.query_map([parent.as_str()], ChildRow::from_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(ChildRow::into_child))
            .collect()
    }

    fn create_device(&self, device: &NewDevice) -> StoreResult<Device> {
        let conn = self.conn()?;
        let key = phone_key(&device.phone_number);

        let imei_taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM devices WHERE imei = ?",
                [&device.imei],
                |row| row.get(0),
            )
            .optional()?;
        if imei_taken.is_some() {
            return Err(StoreError::Conflict(format!(
                "IMEI {} is already registered",
                device.imei
            )));
        }

        let phone_taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM devices WHERE phone_key = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?;
        if phone_taken.is_some() {
            return Err(StoreError::Conflict(format!(
                "phone number {} is already registered",
                device.phone_number
            )));
        }

        conn.execute(
            r#"
            INSERT INTO devices
                (child_id, name, imei, phone_number, phone_key, device_fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                device.child_id.get(),
                device.name,
                device.imei,
                device.phone_number,
                key,
                device.device_fingerprint,
                self.stamp()
            ],
        )?;
        let id = DeviceId::new(conn.last_insert_rowid());

        debug!(device_id = %id, child_id = %device.child_id, "Device created");
        require_device(&conn, id)
    }

    fn get_device(&self, id: DeviceId) -> StoreResult<Option<Device>> {
        let conn = self.conn()?;
        device_by_id(&conn, id)
    }

    fn get_device_by_imei(&self, imei: &str) -> StoreResult<Option<Device>> {
        let conn = self.conn()?;
        query_device(
            &conn,
            &format!("SELECT {DEVICE_COLUMNS} FROM devices d WHERE d.imei = ?"),
            [imei],
        )
    }

    fn get_device_by_phone_number(&self, phone_number: &str) -> StoreResult<Option<Device>> {
        let conn = self.conn()?;
        let exact = query_device(
            &conn,
            &format!("SELECT {DEVICE_COLUMNS} FROM devices d WHERE d.phone_number = ?"),
            [phone_number],
        )?;
        if exact.is_some() {
            return Ok(exact);
        }

        query_device(
            &conn,
            &format!("SELECT {DEVICE_COLUMNS} FROM devices d WHERE d.phone_key = ?"),
            [phone_key(phone_number)],
        )
    }

    fn device_owner(&self, id: DeviceId) -> StoreResult<Option<ParentId>> {
        let conn = self.conn()?;
        let owner: Option<String> = conn
            .query_row(
                "SELECT c.parent_id FROM devices d JOIN children c ON c.id = d.child_id WHERE d.id = ?",
                [id.get()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.map(ParentId::new))
    }

    fn list_devices_for_parent(&self, parent: &ParentId) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;
        query_devices(
            &conn,
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices d \
                 JOIN children c ON c.id = d.child_id \
                 WHERE c.parent_id = ? ORDER BY d.id"
            ),
            [parent.as_str()],
        )
    }

    fn set_device_locked(&self, id: DeviceId, locked: bool) -> StoreResult<Device> {
        let conn = self.conn()?;
        write_lock(&conn, id, locked, &self.stamp())?;
        require_device(&conn, id)
    }

    fn record_lock_change(
        &self,
        id: DeviceId,
        locked: bool,
        entry: &NewActivity,
    ) -> StoreResult<(Device, ActivityEntry)> {
        let mut conn = self.conn()?;
        let at = self.stamp();

        let tx = conn.transaction()?;
        write_lock(&tx, id, locked, &at)?;
        let logged = insert_activity(&tx, entry, &at)?;
        let device = require_device(&tx, id)?;
        tx.commit()?;

        Ok((device, logged))
    }

    fn set_device_consent(&self, id: DeviceId, status: ConsentStatus) -> StoreResult<Device> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET consent_status = ? WHERE id = ?",
            params![status.as_str(), id.get()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("device {id}")));
        }

        require_device(&conn, id)
    }

    fn delete_device(&self, id: DeviceId) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM device_schedules WHERE device_id = ?", [id.get()])?;
        let logs = tx.execute("DELETE FROM activity_logs WHERE device_id = ?", [id.get()])?;
        let changed = tx.execute("DELETE FROM devices WHERE id = ?", [id.get()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("device {id}")));
        }
        tx.commit()?;

        debug!(device_id = %id, activity_removed = logs, "Device deleted");
        Ok(())
    }

    fn create_schedule(&self, schedule: &NewSchedule) -> StoreResult<Schedule> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO schedules
                (parent_id, name, start_time, end_time, days_of_week, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                schedule.parent_id.as_str(),
                schedule.name,
                schedule.start_time.to_string(),
                schedule.end_time.to_string(),
                schedule.days_of_week.to_stored(),
                schedule.is_active,
                self.stamp()
            ],
        )?;
        let id = ScheduleId::new(conn.last_insert_rowid());

        debug!(schedule_id = %id, parent_id = %schedule.parent_id, "Schedule created");
        schedule_by_id(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))
    }

    fn get_schedule(&self, id: ScheduleId) -> StoreResult<Option<Schedule>> {
        let conn = self.conn()?;
        schedule_by_id(&conn, id)
    }

    fn update_schedule(&self, id: ScheduleId, update: &ScheduleUpdate) -> StoreResult<Schedule> {
        let conn = self.conn()?;
        let mut schedule =
            schedule_by_id(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))?;
        update.apply_to(&mut schedule);

        conn.execute(
            r#"
            UPDATE schedules
            SET name = ?, start_time = ?, end_time = ?, days_of_week = ?, is_active = ?
            WHERE id = ?
            "#,
            params![
                schedule.name,
                schedule.start_time.to_string(),
                schedule.end_time.to_string(),
                schedule.days_of_week.to_stored(),
                schedule.is_active,
                id.get()
            ],
        )?;

        debug!(schedule_id = %id, "Schedule updated");
        Ok(schedule)
    }

    fn delete_schedule(&self, id: ScheduleId) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let associations =
            tx.execute("DELETE FROM device_schedules WHERE schedule_id = ?", [id.get()])?;
        let changed = tx.execute("DELETE FROM schedules WHERE id = ?", [id.get()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("schedule {id}")));
        }
        tx.commit()?;

        debug!(schedule_id = %id, associations_removed = associations, "Schedule deleted");
        Ok(())
    }

    fn list_schedules_by_parent(&self, parent: &ParentId) -> StoreResult<Vec<Schedule>> {
        let conn = self.conn()?;
        query_schedules(
            &conn,
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules s WHERE s.parent_id = ? ORDER BY s.id"),
            [parent.as_str()],
        )
    }

    fn list_schedules_for_device(&self, device: DeviceId) -> StoreResult<Vec<Schedule>> {
        let conn = self.conn()?;
        query_schedules(
            &conn,
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules s \
                 JOIN device_schedules ds ON ds.schedule_id = s.id \
                 WHERE ds.device_id = ? ORDER BY s.id"
            ),
            [device.get()],
        )
    }

    fn assign_device_schedule(
        &self,
        device: DeviceId,
        schedule: ScheduleId,
    ) -> StoreResult<DeviceSchedule> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO device_schedules (device_id, schedule_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id, schedule_id) DO NOTHING
            "#,
            params![device.get(), schedule.get(), self.stamp()],
        )?;
        if inserted == 0 {
            debug!(device_id = %device, schedule_id = %schedule, "Association already present");
        }

        conn.query_row(
            "SELECT id, device_id, schedule_id, created_at FROM device_schedules \
             WHERE device_id = ? AND schedule_id = ?",
            [device.get(), schedule.get()],
            AssociationRow::from_row,
        )?
        .into_association()
    }

    fn unassign_device_schedule(
        &self,
        device: DeviceId,
        schedule: ScheduleId,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM device_schedules WHERE device_id = ? AND schedule_id = ?",
            [device.get(), schedule.get()],
        )?;
        Ok(removed > 0)
    }

    fn list_devices_for_schedule(&self, schedule: ScheduleId) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;
        query_devices(
            &conn,
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices d \
                 JOIN device_schedules ds ON ds.device_id = d.id \
                 WHERE ds.schedule_id = ? ORDER BY d.id"
            ),
            [schedule.get()],
        )
    }

    fn append_activity(&self, entry: &NewActivity) -> StoreResult<ActivityEntry> {
        let conn = self.conn()?;
        insert_activity(&conn, entry, &self.stamp())
    }

    fn recent_activity_for_parent(
        &self,
        parent: &ParentId,
        limit: usize,
    ) -> StoreResult<Vec<ActivityEntry>> {
        let conn = self.conn()?;
        query_activity(
            &conn,
            &format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activity_logs a \
                 JOIN devices d ON d.id = a.device_id \
                 JOIN children c ON c.id = d.child_id \
                 WHERE c.parent_id = ? \
                 ORDER BY a.timestamp DESC, a.id DESC LIMIT ?"
            ),
            params![parent.as_str(), limit as i64],
        )
    }

    fn activity_for_device(
        &self,
        device: DeviceId,
        limit: usize,
    ) -> StoreResult<Vec<ActivityEntry>> {
        let conn = self.conn()?;
        query_activity(
            &conn,
            &format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activity_logs a \
                 WHERE a.device_id = ? ORDER BY a.timestamp DESC, a.id DESC LIMIT ?"
            ),
            params![device.get(), limit as i64],
        )
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
