//! Generic per-stream machinery: format seam and the stream processor
//! state machine.

pub mod format;
pub mod processor;

pub use format::{AudioDataType, ChildReturn, PacketFormat, StreamConfig};
pub use processor::{Direction, ProcessorState, StreamProcessor};
