//! curfewd - The curfew background service
//!
//! This is the main entry point for the curfewd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Enforcement engine and periodic loop
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use curfew_api::{
    ClientInfo, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Response,
    ResponsePayload,
};
use curfew_config::{ServiceConfig, load_config_or_default};
use curfew_core::{CoreEvent, EngineError, EnforcementEngine, EnforcementLoop, LockChange};
use curfew_ipc::{IpcServer, ServerMessage};
use curfew_store::{SqliteStore, Store, StoreError};
use curfew_util::{Clock, SystemClock, default_config_path};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// curfewd - Schedule-driven device lock enforcement
#[derive(Parser, Debug)]
#[command(name = "curfewd")]
#[command(about = "Schedule-driven device lock enforcement service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/curfew/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set CURFEW_SOCKET env var)
    #[arg(short, long, env = "CURFEW_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set CURFEW_DATA_DIR env var)
    #[arg(short, long, env = "CURFEW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Executes IPC commands against the engine
struct Handler {
    engine: Arc<EnforcementEngine>,
    enforcer: Arc<EnforcementLoop>,
}

/// A response plus the events it should broadcast
struct Handled {
    response: Response,
    events: Vec<EventPayload>,
}

impl Handled {
    fn reply(response: Response) -> Self {
        Self {
            response,
            events: Vec::new(),
        }
    }
}

impl Handler {
    fn handle(&self, client: &ClientInfo, request_id: u64, command: Command) -> Handled {
        if !permitted(client, &command) {
            warn!(client_id = %client.client_id, command = ?command, "Command denied");
            return Handled::reply(Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
            ));
        }

        match self.execute(client, request_id, command) {
            Ok(handled) => handled,
            Err(e) => Handled::reply(engine_error(request_id, e)),
        }
    }

    fn execute(
        &self,
        client: &ClientInfo,
        request_id: u64,
        command: Command,
    ) -> Result<Handled, EngineError> {
        let ok = |payload| Handled::reply(Response::success(request_id, payload));
        let with_changes = |payload, changes: Vec<LockChange>| Handled {
            response: Response::success(request_id, payload),
            events: changes.into_iter().map(lock_event).collect(),
        };

        let handled = match command {
            Command::Enforce {
                parent_id,
                time_zone,
            } => {
                let (summary, changes) =
                    self.engine.enforce_for_parent(&parent_id, time_zone.as_deref())?;
                with_changes(ResponsePayload::Enforced(summary), changes)
            }

            Command::ActiveSchedules {
                parent_id,
                time_zone,
            } => ok(ResponsePayload::Schedules(
                self.engine.active_schedules(&parent_id, time_zone.as_deref())?,
            )),

            // Lock changes and the summary flow out through the loop's events
            Command::RunPass => match self.enforcer.tick() {
                Some(report) => ok(ResponsePayload::PassCompleted(report)),
                None => Handled::reply(Response::error(
                    request_id,
                    ErrorInfo::new(
                        ErrorCode::Conflict,
                        "Enforcement pass already running or failed to start",
                    ),
                )),
            },

            Command::UpsertUser { user } => {
                self.engine.upsert_user(&user)?;
                ok(ResponsePayload::UserSaved)
            }

            Command::CreateChild { child } => {
                ok(ResponsePayload::Child(self.engine.create_child(&child)?))
            }

            Command::ListChildren { parent_id } => {
                ok(ResponsePayload::Children(self.engine.list_children(&parent_id)?))
            }

            Command::RegisterDevice { device } => {
                ok(ResponsePayload::Device(self.engine.register_device(&device)?))
            }

            Command::ListDevices { parent_id } => {
                ok(ResponsePayload::Devices(self.engine.list_devices(&parent_id)?))
            }

            Command::DeleteDevice {
                parent_id,
                device_id,
            } => {
                self.engine.delete_device(&parent_id, device_id)?;
                ok(ResponsePayload::Deleted)
            }

            Command::SetConsent { device_id, status } => {
                ok(ResponsePayload::Device(self.engine.set_consent(device_id, status)?))
            }

            Command::CreateSchedule {
                schedule,
                device_ids,
            } => ok(ResponsePayload::Schedule(
                self.engine.create_schedule(&schedule, &device_ids)?,
            )),

            Command::UpdateSchedule {
                parent_id,
                schedule_id,
                update,
            } => ok(ResponsePayload::Schedule(
                self.engine.update_schedule(&parent_id, schedule_id, &update)?,
            )),

            Command::DeleteSchedule {
                parent_id,
                schedule_id,
            } => {
                self.engine.delete_schedule(&parent_id, schedule_id)?;
                ok(ResponsePayload::Deleted)
            }

            Command::ListSchedules { parent_id } => {
                ok(ResponsePayload::Schedules(self.engine.list_schedules(&parent_id)?))
            }

            Command::ListScheduleDevices {
                parent_id,
                schedule_id,
            } => ok(ResponsePayload::Devices(
                self.engine.schedule_devices(&parent_id, schedule_id)?,
            )),

            Command::AssignSchedule {
                parent_id,
                device_id,
                schedule_id,
            } => ok(ResponsePayload::Association(
                self.engine
                    .assign_schedule(&parent_id, device_id, schedule_id)?,
            )),

            Command::UnassignSchedule {
                parent_id,
                device_id,
                schedule_id,
            } => {
                self.engine
                    .unassign_schedule(&parent_id, device_id, schedule_id)?;
                ok(ResponsePayload::Deleted)
            }

            Command::SetDeviceLock {
                parent_id,
                device_id,
                locked,
            } => {
                let (device, change) =
                    self.engine.set_device_lock(&parent_id, device_id, locked)?;
                with_changes(ResponsePayload::Device(device), change.into_iter().collect())
            }

            Command::SetAllDevicesLock { parent_id, locked } => {
                let (summary, changes) = self.engine.set_all_devices_lock(&parent_id, locked)?;
                with_changes(ResponsePayload::BulkLock(summary), changes)
            }

            Command::QuickLock {
                parent_id,
                device_id,
                duration_minutes,
            } => {
                let (summary, change) =
                    self.engine.quick_lock(&parent_id, device_id, duration_minutes)?;
                with_changes(ResponsePayload::QuickLock(summary), change.into_iter().collect())
            }

            Command::RecentActivity { parent_id, limit } => ok(ResponsePayload::Activity(
                self.engine.recent_activity(&parent_id, limit)?,
            )),

            Command::DeviceActivity {
                parent_id,
                device_id,
                limit,
            } => ok(ResponsePayload::Activity(
                self.engine.device_activity(&parent_id, device_id, limit)?,
            )),

            Command::DeviceStatus { device_id } => {
                ok(ResponsePayload::DeviceStatus(self.engine.device_status(device_id)?))
            }

            Command::CompanionStatus { imei, identity } => ok(ResponsePayload::DeviceStatus(
                self.engine.companion_status(&imei, &identity)?,
            )),

            Command::LookupDevice { phone_number } => ok(ResponsePayload::DeviceLookup(
                self.engine.lookup_device(&phone_number)?,
            )),

            Command::SubscribeEvents => ok(ResponsePayload::Subscribed {
                client_id: client.client_id.clone(),
            }),

            Command::UnsubscribeEvents => ok(ResponsePayload::Unsubscribed),

            Command::GetHealth => ok(ResponsePayload::Health(HealthStatus {
                live: true,
                store_ok: self.engine.is_store_healthy(),
                loop_state: self.enforcer.state(),
                last_pass: self.enforcer.last_report(),
            })),

            Command::Ping => ok(ResponsePayload::Pong),
        };

        Ok(handled)
    }
}

fn permitted(client: &ClientInfo, command: &Command) -> bool {
    match command {
        Command::Enforce { .. } | Command::RunPass => client.role.can_enforce(),
        c if c.is_mutating() => client.role.can_modify(),
        _ => true,
    }
}

fn engine_error(request_id: u64, error: EngineError) -> Response {
    let code = match &error {
        EngineError::NotFound(_) | EngineError::Store(StoreError::NotFound(_)) => {
            ErrorCode::NotFound
        }
        EngineError::Forbidden(_) => ErrorCode::PermissionDenied,
        EngineError::InvalidInput(_) => ErrorCode::InvalidRequest,
        EngineError::Store(StoreError::Conflict(_)) => ErrorCode::Conflict,
        EngineError::Store(_) => ErrorCode::StoreError,
    };

    if code == ErrorCode::StoreError {
        error!(error = %error, "Store failure while handling request");
    } else {
        debug!(error = %error, "Request rejected");
    }

    Response::error(request_id, ErrorInfo::new(code, error.to_string()))
}

fn lock_event(change: LockChange) -> EventPayload {
    EventPayload::DeviceLockChanged {
        device_id: change.device_id,
        device_name: change.device_name,
        locked: change.locked,
        action: change.action,
    }
}

fn core_event_payload(event: CoreEvent) -> EventPayload {
    match event {
        CoreEvent::DeviceLockChanged(change) => lock_event(change),
        CoreEvent::PassCompleted(report) => EventPayload::EnforcementPassCompleted(report),
        CoreEvent::LoopStateChanged(state) => EventPayload::LoopStateChanged { state },
    }
}

/// Main service state
struct Service {
    handler: Arc<Handler>,
    ipc: Arc<IpcServer>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let config = load_config_or_default(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        let config = ServiceConfig {
            socket_path: args.socket.clone().unwrap_or(config.socket_path),
            data_dir: args.data_dir.clone().unwrap_or(config.data_dir),
            ..config
        };

        info!(
            config_path = %args.config.display(),
            default_time_zone = %config.default_time_zone,
            interval_secs = config.enforcement_interval.as_secs(),
            "Configuration loaded"
        );

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let db_path = config.database_path();
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?
                .with_clock(clock.clone()),
        );

        info!(db_path = %db_path.display(), "Store initialized");

        if curfew_util::is_mock_time_active() {
            warn!(
                env = curfew_util::MOCK_TIME_ENV_VAR,
                now = %curfew_util::now(),
                "Mock time is active"
            );
        }

        let engine = Arc::new(EnforcementEngine::new(store, clock, config.default_time_zone));
        let enforcer = Arc::new(EnforcementLoop::new(
            engine.clone(),
            config.enforcement_interval,
            config.skip_overlapping_ticks,
        ));

        let mut ipc = IpcServer::new(&config.socket_path);
        ipc.start().await?;

        info!(socket_path = %config.socket_path.display(), "IPC server started");

        Ok(Self {
            handler: Arc::new(Handler { engine, enforcer }),
            ipc: Arc::new(ipc),
        })
    }

    async fn run(self) -> Result<()> {
        let ipc = self.ipc.clone();
        let mut ipc_messages = ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let ipc_accept = ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut core_events = self.handler.enforcer.subscribe();
        self.handler.enforcer.start();

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                event = core_events.recv() => {
                    match event {
                        Ok(event) => ipc.broadcast_event(Event::new(core_event_payload(event))),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Dropped enforcement events");
                        }
                        Err(RecvError::Closed) => {
                            error!("Enforcement event channel closed");
                            break;
                        }
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&self.handler, &ipc, msg).await;
                }
            }
        }

        info!("Shutting down curfewd");

        // Waits for an in-flight pass; the timer fires no further ticks
        self.handler.enforcer.stop().await;
        while let Ok(event) = core_events.try_recv() {
            ipc.broadcast_event(Event::new(core_event_payload(event)));
        }
        ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        ipc.shutdown();

        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(handler: &Arc<Handler>, ipc: &Arc<IpcServer>, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let Some(client) = ipc.get_client_info(&client_id).await else {
                    debug!(client_id = %client_id, "Request from departed client");
                    return;
                };

                let request_id = request.request_id;
                let worker = handler.clone();
                let handled = tokio::task::spawn_blocking(move || {
                    worker.handle(&client, request_id, request.command)
                })
                .await;

                let response = match handled {
                    Ok(handled) => {
                        for payload in handled.events {
                            ipc.broadcast_event(Event::new(payload));
                        }
                        handled.response
                    }
                    Err(e) => {
                        error!(error = %e, "Command handler panicked");
                        Response::error(
                            request_id,
                            ErrorInfo::new(ErrorCode::InternalError, "Internal error"),
                        )
                    }
                };

                if let Err(e) = ipc.send_response(&client_id, response).await {
                    debug!(client_id = %client_id, error = %e, "Failed to send response");
                }
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "curfewd starting");

    let service = Service::new(&args).await?;
    service.run().await
}
