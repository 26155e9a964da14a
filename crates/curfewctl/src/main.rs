//! curfewctl - command-line client for curfewd

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use curfew_api::{Command, CompanionIdentity, ConsentStatus, NewSchedule, ScheduleUpdate};
use curfew_ipc::IpcClient;
use curfew_util::{
    DaysOfWeek, DeviceId, ParentId, ScheduleId, WallClock, default_socket_path,
    weekday_from_name,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "curfewctl")]
#[command(about = "Control and inspect the curfewd service", long_about = None)]
struct Cli {
    /// Socket path (or set CURFEW_SOCKET env var)
    #[arg(short, long, env = "CURFEW_SOCKET", default_value_os_t = default_socket_path())]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the daemon answers
    Ping,

    /// Show store health and enforcement loop state
    Health,

    /// Reconcile every device of a parent now
    Enforce {
        parent: String,
        /// IANA time zone to evaluate schedules in
        #[arg(long)]
        tz: Option<String>,
    },

    /// Run one system-wide enforcement pass
    RunPass,

    /// List schedules in effect right now
    Active {
        parent: String,
        #[arg(long)]
        tz: Option<String>,
    },

    /// Schedule management
    #[command(subcommand)]
    Schedule(ScheduleCommands),

    /// List a parent's devices
    Devices { parent: String },

    /// Approve or deny a device
    Consent {
        device: i64,
        #[arg(value_parser = parse_consent)]
        status: ConsentStatus,
    },

    /// Lock one device, or every device of the parent with --all
    Lock {
        parent: String,
        device: Option<i64>,
        #[arg(long, conflicts_with = "device")]
        all: bool,
    },

    /// Unlock one device, or every device of the parent with --all
    Unlock {
        parent: String,
        device: Option<i64>,
        #[arg(long, conflicts_with = "device")]
        all: bool,
    },

    /// Lock a device for a number of minutes
    QuickLock {
        parent: String,
        device: i64,
        #[arg(value_parser = clap::value_parser!(u32).range(1..1440))]
        minutes: u32,
    },

    /// Recent activity, newest first
    Activity {
        parent: String,
        #[arg(long)]
        device: Option<i64>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Status as the companion app sees it
    Status { device: i64 },

    /// Status for a device identified by IMEI, checked against its phone or fingerprint
    Companion {
        imei: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        fingerprint: Option<String>,
    },

    /// Find a registered device by phone number
    Lookup { phone: String },

    /// Stream events until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// List a parent's schedules
    List { parent: String },

    /// Create a schedule
    Create {
        parent: String,
        name: String,
        /// Start time, HH:MM
        start: WallClock,
        /// End time, HH:MM; earlier than start means overnight
        end: WallClock,
        /// Days: comma-separated indices (0 = Sunday) or names, or weekdays/weekends/all
        #[arg(long, value_parser = parse_days, default_value = "all")]
        days: DaysOfWeek,
        /// Create disabled
        #[arg(long)]
        disabled: bool,
        /// Devices to assign it to
        #[arg(long = "device")]
        devices: Vec<i64>,
    },

    /// Edit fields of a schedule
    Update {
        parent: String,
        schedule: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        start: Option<WallClock>,
        #[arg(long)]
        end: Option<WallClock>,
        #[arg(long, value_parser = parse_days)]
        days: Option<DaysOfWeek>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },

    /// Delete a schedule
    Delete { parent: String, schedule: i64 },

    /// Devices following a schedule
    Devices { parent: String, schedule: i64 },

    /// Assign a schedule to a device
    Assign {
        parent: String,
        schedule: i64,
        device: i64,
    },

    /// Remove a schedule from a device
    Unassign {
        parent: String,
        schedule: i64,
        device: i64,
    },
}

fn parse_days(value: &str) -> Result<DaysOfWeek, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "all" => return Ok(DaysOfWeek::ALL_DAYS),
        "weekdays" => return Ok(DaysOfWeek::WEEKDAYS),
        "weekends" => return Ok(DaysOfWeek::WEEKENDS),
        _ => {}
    }

    let mut days = DaysOfWeek::NONE;
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let index = match part.parse::<u8>() {
            Ok(i) if i < 7 => i,
            Ok(i) => return Err(format!("day index {i} out of range 0-6")),
            Err(_) => weekday_from_name(part).ok_or_else(|| format!("unknown day '{part}'"))?,
        };
        days.insert_index(index);
    }
    Ok(days)
}

fn parse_consent(value: &str) -> Result<ConsentStatus, String> {
    ConsentStatus::parse(value).ok_or_else(|| format!("unknown consent status '{value}'"))
}

fn to_command(command: Commands) -> Result<Command> {
    let command = match command {
        Commands::Ping => Command::Ping,
        Commands::Health => Command::GetHealth,
        Commands::Enforce { parent, tz } => Command::Enforce {
            parent_id: ParentId::new(parent),
            time_zone: tz,
        },
        Commands::RunPass => Command::RunPass,
        Commands::Active { parent, tz } => Command::ActiveSchedules {
            parent_id: ParentId::new(parent),
            time_zone: tz,
        },
        Commands::Schedule(cmd) => schedule_command(cmd)?,
        Commands::Devices { parent } => Command::ListDevices {
            parent_id: ParentId::new(parent),
        },
        Commands::Consent { device, status } => Command::SetConsent {
            device_id: DeviceId::new(device),
            status,
        },
        Commands::Lock {
            parent,
            device,
            all,
        } => lock_command(parent, device, all, true)?,
        Commands::Unlock {
            parent,
            device,
            all,
        } => lock_command(parent, device, all, false)?,
        Commands::QuickLock {
            parent,
            device,
            minutes,
        } => Command::QuickLock {
            parent_id: ParentId::new(parent),
            device_id: DeviceId::new(device),
            duration_minutes: minutes,
        },
        Commands::Activity {
            parent,
            device,
            limit,
        } => match device {
            Some(device) => Command::DeviceActivity {
                parent_id: ParentId::new(parent),
                device_id: DeviceId::new(device),
                limit,
            },
            None => Command::RecentActivity {
                parent_id: ParentId::new(parent),
                limit,
            },
        },
        Commands::Status { device } => Command::DeviceStatus {
            device_id: DeviceId::new(device),
        },
        Commands::Companion {
            imei,
            phone,
            fingerprint,
        } => Command::CompanionStatus {
            imei,
            identity: CompanionIdentity {
                phone_number: phone,
                device_fingerprint: fingerprint,
            },
        },
        Commands::Lookup { phone } => Command::LookupDevice {
            phone_number: phone,
        },
        Commands::Watch => Command::SubscribeEvents,
    };
    Ok(command)
}

fn lock_command(parent: String, device: Option<i64>, all: bool, locked: bool) -> Result<Command> {
    let parent_id = ParentId::new(parent);
    match (device, all) {
        (Some(device), false) => Ok(Command::SetDeviceLock {
            parent_id,
            device_id: DeviceId::new(device),
            locked,
        }),
        (None, true) => Ok(Command::SetAllDevicesLock { parent_id, locked }),
        _ => bail!("give a device id or --all"),
    }
}

fn schedule_command(command: ScheduleCommands) -> Result<Command> {
    let command = match command {
        ScheduleCommands::List { parent } => Command::ListSchedules {
            parent_id: ParentId::new(parent),
        },
        ScheduleCommands::Create {
            parent,
            name,
            start,
            end,
            days,
            disabled,
            devices,
        } => Command::CreateSchedule {
            schedule: NewSchedule {
                parent_id: ParentId::new(parent),
                name,
                start_time: start,
                end_time: end,
                days_of_week: days,
                is_active: !disabled,
            },
            device_ids: devices.into_iter().map(DeviceId::new).collect(),
        },
        ScheduleCommands::Update {
            parent,
            schedule,
            name,
            start,
            end,
            days,
            enable,
            disable,
        } => {
            let update = ScheduleUpdate {
                name,
                start_time: start,
                end_time: end,
                days_of_week: days,
                is_active: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            if update.is_empty() {
                bail!("nothing to update");
            }
            Command::UpdateSchedule {
                parent_id: ParentId::new(parent),
                schedule_id: ScheduleId::new(schedule),
                update,
            }
        }
        ScheduleCommands::Delete { parent, schedule } => Command::DeleteSchedule {
            parent_id: ParentId::new(parent),
            schedule_id: ScheduleId::new(schedule),
        },
        ScheduleCommands::Devices { parent, schedule } => Command::ListScheduleDevices {
            parent_id: ParentId::new(parent),
            schedule_id: ScheduleId::new(schedule),
        },
        ScheduleCommands::Assign {
            parent,
            schedule,
            device,
        } => Command::AssignSchedule {
            parent_id: ParentId::new(parent),
            device_id: DeviceId::new(device),
            schedule_id: ScheduleId::new(schedule),
        },
        ScheduleCommands::Unassign {
            parent,
            schedule,
            device,
        } => Command::UnassignSchedule {
            parent_id: ParentId::new(parent),
            device_id: DeviceId::new(device),
            schedule_id: ScheduleId::new(schedule),
        },
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = IpcClient::connect(&cli.socket)
        .await
        .with_context(|| format!("Failed to connect to curfewd at {}", cli.socket.display()))?;

    if matches!(cli.command, Commands::Watch) {
        let mut events = client.subscribe().await?;
        loop {
            let event = events.next().await?;
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    let mut client = client;
    let payload = client.request(to_command(cli.command)?).await?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
