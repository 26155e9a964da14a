//! Core enforcement engine for curfewd
//!
//! This crate contains:
//! - Schedule window evaluation (is a schedule in effect right now?)
//! - Per-device lock reconciliation with activity logging
//! - The enforcement engine serving parent and companion-app operations
//! - The periodic enforcement loop with its overlap guard

mod engine;
mod enforcer;
mod error;
mod evaluator;
mod events;
mod reconciler;

pub use engine::*;
pub use enforcer::*;
pub use error::*;
pub use evaluator::*;
pub use events::*;
pub use reconciler::*;
