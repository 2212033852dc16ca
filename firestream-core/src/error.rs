//! Error surface of the streaming core.

use thiserror::Error;

/// Errors surfaced by the streaming core. These are returned, never thrown:
/// the realtime paths report a disposition per packet and latch flags; the
/// control paths return `Result`.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The bus was reset; streams must be restarted by the caller.
    #[error("bus reset (generation {0})")]
    BusReset(u32),
    /// A buffer under- or overrun was detected.
    #[error("xrun: {0}")]
    XRun(&'static str),
    /// An isochronous handler died; the whole streaming system must be
    /// torn down.
    #[error("iso handler died")]
    HandlerDead,
    /// A wait did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// Malformed packet or inconsistent stream parameters.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Could not allocate an ISO context, channel or bandwidth.
    #[error("resource error: {0}")]
    Resource(String),
    /// Error reported by the bus service implementation.
    #[error("bus error: {0}")]
    Bus(String),
    /// Error from the clock layer.
    #[error(transparent)]
    Clock(#[from] firestream_clock::ClockError),
    /// The streaming system is beyond recovery and must be torn down.
    #[error("shutdown needed")]
    ShutdownNeeded,
    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, StreamError>;
