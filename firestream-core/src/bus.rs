//! Abstraction over the 1394 isochronous transport.
//!
//! The kernel/user transport itself is out of scope for the streaming core;
//! everything it needs from the 1394 stack is expressed by [`BusService`].
//! Packet I/O is callback driven, raw1394 style: the bus implementation
//! calls the registered [`IsoPacketClient`] once per packet and maps the
//! returned [`IsoDisposition`] onto its kernel API.

use std::sync::Arc;

use firestream_clock::CycleTimerSource;

use crate::error::Result;

/// Direction of an isochronous context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoDirection {
    Receive,
    Transmit,
}

/// Bus speed of an isochronous context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoSpeed {
    S100,
    S200,
    S400,
}

/// DMA mode for receive contexts. Packet-per-buffer is the safe default;
/// buffer-fill may perform better on some controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    PacketPerBuffer,
    BufferFill,
}

/// Parameters for context creation.
#[derive(Debug, Clone)]
pub struct IsoContextParams {
    pub direction: IsoDirection,
    pub channel: u8,
    pub speed: IsoSpeed,
    pub max_packet_size: u32,
    /// Number of packet slots in the context ring.
    pub buf_packets: u32,
    /// Packets per completion interrupt.
    pub irq_interval: u32,
    pub receive_mode: ReceiveMode,
}

/// Opaque context handle issued by the bus service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsoContextId(pub u64);

/// What the packet client wants the transport to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoDisposition {
    /// Packet handled; keep going.
    Ok,
    /// Packet handled, but stop the current loop iteration early.
    Defer,
    /// Not handled; present the same slot again later.
    Again,
    /// Stop the context.
    Stop,
    /// Unrecoverable error on this context.
    Error,
}

/// Per-packet callbacks, implemented by the iso handler.
pub trait IsoPacketClient: Send {
    /// A packet arrived on a receive context. `cycle` is the 13-bit bus
    /// cycle it was received on; `dropped` is the kernel-side drop count.
    fn put_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: u32,
        dropped: u32,
        skipped: u32,
    ) -> IsoDisposition;

    /// The transmit context wants a packet for `cycle` (-1 if unknown).
    /// The client fills `data` and sets `length`, `tag` and `sy`.
    fn get_packet(
        &mut self,
        data: &mut [u8],
        length: &mut usize,
        tag: &mut u8,
        sy: &mut u8,
        cycle: i32,
        dropped: u32,
        skipped: u32,
    ) -> IsoDisposition;
}

/// Per-packet queue descriptor, fw-cdev style. The control word packs
/// `payload_length:16 | interrupt:1 | skip:1 | tag:2 | sy:4 | header_length:8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoPacketDescriptor {
    pub payload_length: u16,
    pub interrupt: bool,
    pub skip: bool,
    pub tag: u8,
    pub sy: u8,
    pub header_length: u8,
}

impl IsoPacketDescriptor {
    pub fn control_word(&self) -> u32 {
        self.payload_length as u32
            | ((self.interrupt as u32) << 16)
            | ((self.skip as u32) << 17)
            | ((self.tag as u32 & 0x3) << 18)
            | ((self.sy as u32 & 0xF) << 20)
            | ((self.header_length as u32) << 24)
    }

    pub fn from_control_word(word: u32) -> Self {
        Self {
            payload_length: (word & 0xFFFF) as u16,
            interrupt: word & (1 << 16) != 0,
            skip: word & (1 << 17) != 0,
            tag: ((word >> 18) & 0x3) as u8,
            sy: ((word >> 20) & 0xF) as u8,
            header_length: (word >> 24) as u8,
        }
    }
}

/// Callback invoked on bus reset with the new generation number.
pub type BusResetHandler = Box<dyn Fn(u32) + Send + Sync>;

/// Everything the streaming core requires from the 1394 subsystem.
///
/// The cycle timer read is inherited from [`CycleTimerSource`] so the same
/// object can feed the DLL helper; implementations should use a dedicated
/// kernel handle for it to keep the packet loop's handle uncontended.
pub trait BusService: CycleTimerSource {
    fn create_iso_context(&self, params: &IsoContextParams) -> Result<IsoContextId>;

    /// Starts the context. `start_cycle` of -1 means "as soon as possible";
    /// otherwise the 13-bit cycle the context starts on.
    fn start_iso(&self, ctx: IsoContextId, start_cycle: i32, sync: u32, tags: u32)
        -> Result<()>;

    fn stop_iso(&self, ctx: IsoContextId) -> Result<()>;

    fn destroy_iso(&self, ctx: IsoContextId) -> Result<()>;

    /// File descriptor to integrate the context into a `poll` set.
    fn poll_fd(&self, ctx: IsoContextId) -> Result<i32>;

    /// Drives one step of the context's packet loop, invoking `client` for
    /// each completed (receive) or requested (transmit) packet. Must not
    /// block when no packets are pending.
    fn loop_iterate(&self, ctx: IsoContextId, client: &mut dyn IsoPacketClient) -> Result<()>;

    /// Drains buffered receive descriptors.
    fn flush_iso(&self, ctx: IsoContextId) -> Result<()>;

    fn register_bus_reset_handler(&self, handler: BusResetHandler);

    /// Local node id (6 bits) for CIP source fields.
    fn local_node_id(&self) -> u8;
}

/// Shared reference to a bus service.
pub type SharedBus = Arc<dyn BusService>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_word_roundtrip() {
        let desc = IsoPacketDescriptor {
            payload_length: 1032,
            interrupt: true,
            skip: false,
            tag: 1,
            sy: 0,
            header_length: 8,
        };
        let word = desc.control_word();
        assert_eq!(word & 0xFFFF, 1032);
        assert_ne!(word & (1 << 16), 0);
        assert_eq!((word >> 18) & 0x3, 1);
        assert_eq!(word >> 24, 8);

        let back = IsoPacketDescriptor::from_control_word(word);
        assert_eq!(back.payload_length, 1032);
        assert!(back.interrupt);
        assert!(!back.skip);
        assert_eq!(back.tag, 1);
        assert_eq!(back.sy, 0);
        assert_eq!(back.header_length, 8);
    }
}
