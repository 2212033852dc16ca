//! Cycle timer support for FireWire audio streaming.
//!
//! The IEEE-1394 cycle timer register is the shared clock of the bus: a
//! 32-bit packed counter running at 24.576 MHz that every node can read.
//! This crate provides the arithmetic on that clock (`cycletimer`), a
//! cheap host-time mapping maintained by a background DLL thread
//! (`helper`), and the small platform layer both need (`sys`).

pub mod cycletimer;
pub mod helper;
pub mod sys;

pub use cycletimer::*;
pub use helper::{CycleTimerHelper, CycleTimerSource, SyncClock};

use thiserror::Error;

/// Errors surfaced by the clock layer.
#[derive(Debug, Error)]
pub enum ClockError {
    /// The cycle timer register could not be read from the bus.
    #[error("cycle timer read failed: {0}")]
    Read(String),
    /// The helper thread is not running (never started, or shut down).
    #[error("cycle timer helper is not running")]
    NotRunning,
}
