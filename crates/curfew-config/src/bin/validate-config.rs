//! Checks a curfewd config file and prints the settings it resolves to.
//!
//! `validate-config [path]`; with no path the system default is checked.

use curfew_config::{CURRENT_CONFIG_VERSION, ConfigError, ServiceConfig, load_config};
use curfew_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args = std::env::args_os().skip(1);
    let path = args.next().map(PathBuf::from).unwrap_or_else(default_config_path);
    if args.next().is_some() {
        eprintln!("usage: validate-config [config-file]");
        return ExitCode::from(2);
    }

    match load_config(&path) {
        Ok(config) => {
            println!("{}: ok", path.display());
            print_summary(&config);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: invalid", path.display());
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(config: &ServiceConfig) {
    let overlap = if config.skip_overlapping_ticks {
        "skip"
    } else {
        "allow"
    };

    println!("  socket          {}", config.socket_path.display());
    println!("  database        {}", config.database_path().display());
    println!("  time zone       {}", config.default_time_zone);
    println!("  interval        {}s", config.enforcement_interval.as_secs());
    println!("  overlapping     {overlap}");
}

fn report(error: &ConfigError) {
    match error {
        ConfigError::ValidationFailed { errors } => {
            for err in errors {
                eprintln!("  - {err}");
            }
        }
        ConfigError::UnsupportedVersion(found) => {
            eprintln!("  config_version {found} is not supported, use {CURRENT_CONFIG_VERSION}");
        }
        other => eprintln!("  {other}"),
    }
}
