//! Error types for curfew

use thiserror::Error;

/// Errors raised while parsing curfew primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurfewError {
    #[error("Invalid time '{value}': {message}")]
    InvalidTime { value: String, message: String },

    #[error("Unknown time zone: {0}")]
    UnknownTimeZone(String),

    #[error("Invalid weekday: {0}")]
    InvalidWeekday(String),
}

impl CurfewError {
    pub fn invalid_time(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTime {
            value: value.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CurfewError>;
