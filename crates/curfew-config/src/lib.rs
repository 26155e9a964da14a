//! curfewd configuration.
//!
//! A single versioned TOML file with an optional `[service]` table. Missing
//! keys take defaults; bad values are collected and reported together.

mod schema;
mod service;
mod validation;

pub use schema::*;
pub use service::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Schema version this build understands
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("malformed TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("{} invalid setting(s): {errors:?}", errors.len())]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("config_version {0} is not supported")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ServiceConfig> {
    parse_config(&std::fs::read_to_string(path)?)
}

/// Like [`load_config`], but an absent file yields the defaults
pub fn load_config_or_default(path: impl AsRef<Path>) -> ConfigResult<ServiceConfig> {
    let path = path.as_ref();
    if path.exists() {
        return load_config(path);
    }
    tracing::info!(path = %path.display(), "No config file, using defaults");
    Ok(ServiceConfig::default())
}

pub fn parse_config(content: &str) -> ConfigResult<ServiceConfig> {
    let raw: RawConfig = toml::from_str(content)?;
    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    match validate_config(&raw) {
        errors if errors.is_empty() => Ok(ServiceConfig::from_raw(raw)),
        errors => Err(ConfigError::ValidationFailed { errors }),
    }
}
