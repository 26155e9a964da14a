//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// IANA zone used when a request carries no zone, and by the periodic pass
    pub default_time_zone: Option<String>,

    /// Seconds between periodic enforcement passes
    pub enforcement_interval_seconds: Option<u64>,

    /// Skip a tick while the previous pass is still running
    pub skip_overlapping_ticks: Option<bool>,
}
