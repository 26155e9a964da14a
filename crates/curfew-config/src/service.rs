//! Validated service configuration

use crate::schema::{RawConfig, RawServiceConfig};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::time::Duration;

/// Default seconds between periodic enforcement passes
pub const DEFAULT_ENFORCEMENT_INTERVAL_SECS: u64 = 120;

/// Validated configuration ready for use by the daemon
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    /// Zone for the periodic pass and for requests without a usable hint
    pub default_time_zone: Tz,
    pub enforcement_interval: Duration,
    pub skip_overlapping_ticks: bool,
}

impl ServiceConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let RawServiceConfig {
            socket_path,
            data_dir,
            default_time_zone,
            enforcement_interval_seconds,
            skip_overlapping_ticks,
        } = raw.service;

        let defaults = Self::default();
        Self {
            socket_path: socket_path.unwrap_or(defaults.socket_path),
            data_dir: data_dir.unwrap_or(defaults.data_dir),
            default_time_zone: default_time_zone
                .as_deref()
                .and_then(|z| curfew_util::parse_time_zone(z).ok())
                .unwrap_or(defaults.default_time_zone),
            enforcement_interval: enforcement_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.enforcement_interval),
            skip_overlapping_ticks: skip_overlapping_ticks
                .unwrap_or(defaults.skip_overlapping_ticks),
        }
    }

    /// SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        curfew_util::database_path(&self.data_dir)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: curfew_util::xdg_socket_path(),
            data_dir: curfew_util::xdg_data_dir(),
            default_time_zone: curfew_util::default_time_zone(),
            enforcement_interval: Duration::from_secs(DEFAULT_ENFORCEMENT_INTERVAL_SECS),
            skip_overlapping_ticks: true,
        }
    }
}
