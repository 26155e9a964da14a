//! Configuration validation

use crate::schema::{RawConfig, RawServiceConfig};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Unknown time zone '{0}'")]
    UnknownTimeZone(String),

    #[error("enforcement_interval_seconds must be greater than zero")]
    ZeroInterval,

    #[error("{field} cannot be empty")]
    EmptyPath { field: &'static str },
}

/// Validate a raw configuration, collecting every problem found
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    validate_service(&config.service)
}

fn validate_service(service: &RawServiceConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(zone) = &service.default_time_zone
        && curfew_util::parse_time_zone(zone).is_err()
    {
        errors.push(ValidationError::UnknownTimeZone(zone.clone()));
    }

    if service.enforcement_interval_seconds == Some(0) {
        errors.push(ValidationError::ZeroInterval);
    }

    if let Some(path) = &service.socket_path
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::EmptyPath {
            field: "socket_path",
        });
    }

    if let Some(path) = &service.data_dir
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::EmptyPath { field: "data_dir" });
    }

    errors
}
