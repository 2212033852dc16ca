//! AMDTP (IEC 61883-6) packetization.

pub mod encode;
pub mod packet;
pub mod receive;
pub mod transmit;

pub use receive::AmdtpReceive;
pub use transmit::{AmdtpTransmit, AMDTP_MAX_PACKET_SIZE};
