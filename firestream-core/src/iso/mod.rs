//! Isochronous packet I/O: per-context handlers and the shared pump task.

pub mod handler;
pub mod manager;

pub use handler::{HandlerState, IsoHandler};
pub use manager::{IsoHandlerManager, IsoManagerState, MAX_ISO_HANDLERS};
