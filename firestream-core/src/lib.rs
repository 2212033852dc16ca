//! Streaming core for FireWire pro-audio interfaces.
//!
//! Moves PCM frames between application port buffers and isochronous bus
//! channels with sample-accurate synchronization:
//!
//! - [`buffer::TimestampedBuffer`]: per-stream frame ring with a
//!   timestamped tail and a rate DLL,
//! - [`iso`]: the packet I/O engine, one handler per context and one
//!   poll loop for all of them,
//! - [`amdtp`]: IEC 61883-6 packetization,
//! - [`stream`]: the per-stream state machine,
//! - [`manager::StreamProcessorManager`]: the period-driven multi-stream
//!   coordinator the application talks to.
//!
//! The 1394 transport itself is reached only through [`bus::BusService`];
//! bus time comes from the DLL helper in the `firestream-clock` crate.

pub mod activity;
pub mod amdtp;
pub mod buffer;
pub mod bus;
pub mod error;
pub mod iso;
pub mod manager;
pub mod ports;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, StreamError};

/// Supervision hook for the realtime threads. The real watchdog lives
/// outside the core; a no-op implementation is provided for callers that
/// do not supervise.
pub trait RtWatchdog: Send + Sync {
    fn register_thread(&self, name: &str);
    fn unregister_thread(&self, name: &str);
}

/// Watchdog that does nothing.
pub struct NullWatchdog;

impl RtWatchdog for NullWatchdog {
    fn register_thread(&self, _name: &str) {}
    fn unregister_thread(&self, _name: &str) {}
}
