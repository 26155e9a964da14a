//! Integration tests for curfewd
//!
//! These tests verify the end-to-end behavior of the daemon: schedule
//! evaluation through the engine, the periodic loop, and the IPC surface of
//! the real binary.

use chrono::{DateTime, Utc};
use curfew_api::{
    ActivityAction, Command, Device, EventPayload, LockAction, LoopState, NewChild, NewDevice,
    NewSchedule, ResponsePayload, ResponseResult, Schedule, ScheduleUpdate, User,
};
use curfew_core::{CoreEvent, EnforcementEngine, EnforcementLoop};
use curfew_ipc::IpcClient;
use curfew_store::{SqliteStore, Store};
use curfew_util::{DaysOfWeek, FixedClock, ParentId, WallClock};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::time::Duration;

const UTC: chrono_tz::Tz = chrono_tz::UTC;

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

struct World {
    store: Arc<SqliteStore>,
    clock: Arc<FixedClock>,
    engine: Arc<EnforcementEngine>,
    parent: ParentId,
    device: Device,
}

fn world_with(store: SqliteStore, now: &str) -> World {
    let clock = Arc::new(FixedClock::at(now));
    let store = Arc::new(store.with_clock(clock.clone()));
    let parent = ParentId::new("parent-1");
    store
        .upsert_user(&User {
            id: parent.clone(),
            email: Some("parent@example.com".into()),
            display_name: Some("Parent".into()),
        })
        .unwrap();
    let child = store
        .create_child(&NewChild {
            parent_id: parent.clone(),
            name: "Asha".into(),
            age: Some(11),
        })
        .unwrap();
    let device = store
        .create_device(&NewDevice {
            child_id: child.id,
            name: "Asha's phone".into(),
            imei: "356938035643809".into(),
            phone_number: "+91 98765 43210".into(),
            device_fingerprint: None,
        })
        .unwrap();

    let engine = Arc::new(EnforcementEngine::new(store.clone(), clock.clone(), UTC));
    World {
        store,
        clock,
        engine,
        parent,
        device,
    }
}

fn world(now: &str) -> World {
    world_with(SqliteStore::in_memory().unwrap(), now)
}

fn schedule(parent: &ParentId, name: &str, start: &str, end: &str, days: &[u8]) -> NewSchedule {
    NewSchedule {
        parent_id: parent.clone(),
        name: name.into(),
        start_time: WallClock::parse(start).unwrap(),
        end_time: WallClock::parse(end).unwrap(),
        days_of_week: DaysOfWeek::from_indices(days.iter().copied()),
        is_active: true,
    }
}

fn is_locked(w: &World) -> bool {
    w.store.get_device(w.device.id).unwrap().unwrap().is_locked
}

fn add_bedtime(w: &World, days: &[u8]) -> Schedule {
    w.engine
        .create_schedule(
            &schedule(&w.parent, "Bedtime", "22:00", "06:30", days),
            &[w.device.id],
        )
        .unwrap()
}

#[test]
fn test_bedtime_locks_monday_night_and_unlocks_tuesday_morning() {
    let w = world("2024-01-01T22:05:00Z");
    add_bedtime(&w, &[1]);

    let (summary, _) = w.engine.enforce_for_parent(&w.parent, Some("UTC")).unwrap();
    assert_eq!(summary.updates.len(), 1);
    assert_eq!(summary.updates[0].action, LockAction::Locked);
    assert!(is_locked(&w));

    // Tuesday is not in the day set, so the overnight tail does not apply
    w.clock.set(at("2024-01-02T05:00:00Z"));
    let (summary, _) = w.engine.enforce_for_parent(&w.parent, Some("UTC")).unwrap();
    assert_eq!(summary.updates.len(), 1);
    assert_eq!(summary.updates[0].action, LockAction::Unlocked);
    assert!(!is_locked(&w));

    let log = w.engine.recent_activity(&w.parent, None).unwrap();
    let actions: Vec<_> = log.iter().map(|e| e.action.clone()).collect();
    assert_eq!(
        actions[..2],
        [ActivityAction::ScheduleUnlock, ActivityAction::ScheduleLock]
    );
}

#[test]
fn test_overnight_tail_applies_when_next_day_listed() {
    let w = world("2024-01-02T05:00:00Z");
    add_bedtime(&w, &[1, 2]);

    w.engine.enforce_for_parent(&w.parent, None).unwrap();
    assert!(is_locked(&w));

    w.clock.set(at("2024-01-02T06:31:00Z"));
    w.engine.enforce_for_parent(&w.parent, None).unwrap();
    assert!(!is_locked(&w));
}

#[test]
fn test_repeated_enforcement_writes_once() {
    let w = world("2024-01-01T22:05:00Z");
    add_bedtime(&w, &[1]);

    for _ in 0..3 {
        w.engine.enforce_for_parent(&w.parent, None).unwrap();
        w.engine.run_pass().unwrap();
    }

    let locks = w
        .engine
        .device_activity(&w.parent, w.device.id, Some(50))
        .unwrap()
        .into_iter()
        .filter(|e| e.action.is_lock_transition())
        .count();
    assert_eq!(locks, 1);
}

#[test]
fn test_disabling_schedule_releases_device() {
    let w = world("2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[1]);
    w.engine.run_pass().unwrap();
    assert!(is_locked(&w));

    w.engine
        .update_schedule(
            &w.parent,
            bedtime.id,
            &ScheduleUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(
        w.engine
            .active_schedules(&w.parent, None)
            .unwrap()
            .is_empty()
    );

    let outcome = w.engine.run_pass().unwrap();
    assert_eq!(outcome.changes.len(), 1);
    assert_eq!(outcome.changes[0].action, ActivityAction::AutoScheduleUnlock);
    assert!(!is_locked(&w));
}

#[test]
fn test_any_active_schedule_keeps_device_locked() {
    let w = world("2024-01-01T23:00:00Z");
    add_bedtime(&w, &[1]);
    w.engine
        .create_schedule(
            &schedule(&w.parent, "Homework", "16:00", "18:00", &[1]),
            &[w.device.id],
        )
        .unwrap();

    w.engine.run_pass().unwrap();
    assert!(is_locked(&w));

    let status = w.engine.device_status(w.device.id).unwrap();
    assert_eq!(status.active_schedules.len(), 1);
    assert_eq!(status.active_schedules[0].name, "Bedtime");
}

#[test]
fn test_deleted_schedule_no_longer_binds_device() {
    let w = world("2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[1]);
    w.engine.run_pass().unwrap();

    w.engine.delete_schedule(&w.parent, bedtime.id).unwrap();
    assert!(w.engine.list_schedules(&w.parent).unwrap().is_empty());

    let outcome = w.engine.run_pass().unwrap();
    assert_eq!(outcome.report.updated, 1);
    assert!(!is_locked(&w));
}

#[test]
fn test_legacy_weekday_names_are_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("curfew.db");
    let w = world_with(SqliteStore::open(&path).unwrap(), "2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[]);

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE schedules SET days_of_week = ?1 WHERE id = ?2",
        rusqlite::params![r#"["Monday","Wednesday"]"#, bedtime.id.get()],
    )
    .unwrap();

    let stored = w.store.get_schedule(bedtime.id).unwrap().unwrap();
    assert_eq!(stored.days_of_week.indices(), vec![1, 3]);

    w.engine.run_pass().unwrap();
    assert!(is_locked(&w));
}

#[test]
fn test_malformed_days_never_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("curfew.db");
    let w = world_with(SqliteStore::open(&path).unwrap(), "2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[1]);

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE schedules SET days_of_week = 'garbage' WHERE id = ?1",
        [bedtime.id.get()],
    )
    .unwrap();

    let outcome = w.engine.run_pass().unwrap();
    assert_eq!(outcome.report.failed, 0);
    assert!(!is_locked(&w));
}

#[test]
fn test_manual_lock_then_scheduled_override() {
    let w = world("2024-01-01T12:00:00Z");
    add_bedtime(&w, &[1]);

    let (summary, _) = w.engine.set_all_devices_lock(&w.parent, true).unwrap();
    assert_eq!(summary.affected_devices, 1);
    assert!(is_locked(&w));

    // Noon Monday: no schedule in effect, so the pass releases the device
    let outcome = w.engine.run_pass().unwrap();
    assert_eq!(outcome.report.updated, 1);
    assert!(!is_locked(&w));
}

#[test]
fn test_mixed_day_arrays_follow_first_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("curfew.db");
    let w = world_with(SqliteStore::open(&path).unwrap(), "2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[]);

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE schedules SET days_of_week = ?1 WHERE id = ?2",
        rusqlite::params![r#"[1,"Tuesday"]"#, bedtime.id.get()],
    )
    .unwrap();

    let stored = w.store.get_schedule(bedtime.id).unwrap().unwrap();
    assert_eq!(stored.days_of_week.indices(), vec![1]);

    w.engine.run_pass().unwrap();
    assert!(is_locked(&w));
}

#[test]
fn test_quick_lock_survives_passes_inside_window() {
    let w = world("2024-01-02T09:00:00Z");

    let (summary, change) = w.engine.quick_lock(&w.parent, w.device.id, 45).unwrap();
    assert!(change.is_some());
    assert_eq!(summary.until, WallClock::parse("09:45").unwrap());
    assert!(is_locked(&w));

    for minutes in [10, 20, 30, 40] {
        w.clock.set(at("2024-01-02T09:00:00Z") + chrono::Duration::minutes(minutes));
        let outcome = w.engine.run_pass().unwrap();
        assert_eq!(outcome.report.updated, 0, "released at +{minutes}min");
        assert!(is_locked(&w));
    }

    w.clock.set(at("2024-01-02T09:46:00Z"));
    let outcome = w.engine.run_pass().unwrap();
    assert_eq!(outcome.report.updated, 1);
    assert!(!is_locked(&w));

    let log = w.engine.recent_activity(&w.parent, None).unwrap();
    let actions: Vec<_> = log.iter().map(|e| e.action.clone()).collect();
    assert_eq!(
        actions,
        vec![ActivityAction::AutoScheduleUnlock, ActivityAction::QuickLock]
    );
    assert_eq!(log[1].timestamp, at("2024-01-02T09:00:00Z"));
}

#[test]
fn test_device_removal_cascades() {
    let w = world("2024-01-01T22:05:00Z");
    let bedtime = add_bedtime(&w, &[1]);
    w.engine.run_pass().unwrap();

    w.engine.delete_device(&w.parent, w.device.id).unwrap();
    assert!(w.store.get_device(w.device.id).unwrap().is_none());
    assert!(
        w.engine
            .schedule_devices(&w.parent, bedtime.id)
            .unwrap()
            .is_empty()
    );
    assert!(w.engine.recent_activity(&w.parent, None).unwrap().is_empty());
}

#[test]
fn test_loop_tick_follows_the_clock() {
    let w = world("2024-01-01T22:05:00Z");
    add_bedtime(&w, &[1]);
    let enforcer = EnforcementLoop::new(w.engine.clone(), Duration::from_secs(120), true);

    let report = enforcer.tick().unwrap();
    assert_eq!(report.updated, 1);
    assert!(is_locked(&w));

    w.clock.advance(chrono::Duration::hours(8));
    let report = enforcer.tick().unwrap();
    assert_eq!(report.updated, 1);
    assert!(!is_locked(&w));
}

#[tokio::test]
async fn test_loop_runs_until_stopped() {
    let w = world("2024-01-01T22:05:00Z");
    add_bedtime(&w, &[1]);
    let enforcer = EnforcementLoop::new(w.engine.clone(), Duration::from_millis(25), true);
    let mut events = enforcer.subscribe();

    assert!(enforcer.start());
    let locked = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CoreEvent::DeviceLockChanged(change) = events.recv().await.unwrap() {
                break change;
            }
        }
    })
    .await
    .unwrap();
    assert!(locked.locked);
    assert_eq!(locked.device_id, w.device.id);

    assert!(enforcer.stop().await);
    assert_eq!(enforcer.state(), LoopState::Stopped);
    assert!(enforcer.last_report().is_some());
}

/// Kills the daemon if a test fails before shutting it down
struct Daemon(Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

async fn connect(socket: &Path) -> IpcClient {
    for _ in 0..100 {
        if let Ok(client) = IpcClient::connect(socket).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("curfewd did not open {}", socket.display());
}

async fn ok(client: &mut IpcClient, command: Command) -> ResponsePayload {
    match client.send(command).await.unwrap().result {
        ResponseResult::Ok(payload) => payload,
        ResponseResult::Err(e) => panic!("{:?}: {}", e.code, e.message),
    }
}

#[tokio::test]
async fn test_daemon_serves_enforcement_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("curfewd.sock");
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "config_version = 1\n[service]\ndefault_time_zone = \"UTC\"\n",
    )
    .unwrap();

    let mut daemon = Daemon(
        std::process::Command::new(env!("CARGO_BIN_EXE_curfewd"))
            .arg("--config")
            .arg(&config)
            .arg("--socket")
            .arg(&socket)
            .arg("--data-dir")
            .arg(dir.path().join("data"))
            .env("CURFEW_MOCK_TIME", "2024-01-01 22:05:00")
            .env_remove("RUST_LOG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    );

    let mut client = connect(&socket).await;
    let parent = ParentId::new("parent-1");

    ok(
        &mut client,
        Command::UpsertUser {
            user: User {
                id: parent.clone(),
                email: None,
                display_name: None,
            },
        },
    )
    .await;
    let ResponsePayload::Child(child) = ok(
        &mut client,
        Command::CreateChild {
            child: NewChild {
                parent_id: parent.clone(),
                name: "Asha".into(),
                age: None,
            },
        },
    )
    .await
    else {
        panic!("expected child");
    };
    let ResponsePayload::Device(device) = ok(
        &mut client,
        Command::RegisterDevice {
            device: NewDevice {
                child_id: child.id,
                name: "Phone".into(),
                imei: "356938035643809".into(),
                phone_number: "5550100".into(),
                device_fingerprint: None,
            },
        },
    )
    .await
    else {
        panic!("expected device");
    };
    ok(
        &mut client,
        Command::CreateSchedule {
            schedule: schedule(&parent, "Bedtime", "22:00", "06:30", &[1]),
            device_ids: vec![device.id],
        },
    )
    .await;

    let ResponsePayload::Enforced(summary) = ok(
        &mut client,
        Command::Enforce {
            parent_id: parent.clone(),
            time_zone: None,
        },
    )
    .await
    else {
        panic!("expected enforcement summary");
    };
    assert_eq!(summary.total_devices, 1);
    assert_eq!(summary.updates.len(), 1);
    assert_eq!(summary.updates[0].action, LockAction::Locked);

    let ResponsePayload::Health(health) = ok(&mut client, Command::GetHealth).await else {
        panic!("expected health");
    };
    assert!(health.store_ok);
    assert_eq!(health.loop_state, LoopState::Running);

    let mut events = IpcClient::connect(&socket).await.unwrap().subscribe().await.unwrap();
    ok(
        &mut client,
        Command::SetDeviceLock {
            parent_id: parent,
            device_id: device.id,
            locked: false,
        },
    )
    .await;
    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event.payload,
        EventPayload::DeviceLockChanged { locked: false, action: ActivityAction::ManualUnlock, .. }
    ));

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(daemon.0.id() as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();

    let mut exited = None;
    for _ in 0..100 {
        if let Some(status) = daemon.0.try_wait().unwrap() {
            exited = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(exited.expect("curfewd did not exit").success());
    assert!(!socket.exists());
}
