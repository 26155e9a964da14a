//! Shared utilities for curfew
//!
//! This crate provides:
//! - ID types (ParentId, ChildId, DeviceId, ScheduleId, ClientId)
//! - Wall-clock and weekday primitives for weekly lock windows
//! - Time-zone resolution and an injectable clock
//! - Error types
//! - Default paths for socket, config, and data directories

mod error;
mod ids;
mod paths;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
