//! Core events emitted by the engine and the enforcement loop

use curfew_api::{LoopState, PassReport};

use crate::LockChange;

/// Events emitted by the core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A device was locked or unlocked, by a pass or by a parent
    DeviceLockChanged(LockChange),

    /// A periodic pass finished
    PassCompleted(PassReport),

    /// The enforcement loop started or stopped
    LoopStateChanged(LoopState),
}
