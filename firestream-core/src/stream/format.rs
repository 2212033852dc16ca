//! The seam between the generic stream machinery and a wire format.
//!
//! The state machine, buffer bookkeeping and scheduling are common to every
//! format; everything packet-layout specific sits behind [`PacketFormat`].
//! AMDTP is the one format implemented today; AM824 variants would slot in
//! beside it.

use std::sync::Arc;

use firestream_clock::SyncClock;

use crate::buffer::TimestampedBuffer;
use crate::error::Result;
use crate::ports::Port;

/// Sample representation in the client port buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDataType {
    /// 24-bit samples in the low bits of a `u32` slot.
    Int24,
    /// `f32` bits in a `u32` slot.
    Float,
}

/// Per-stream configuration, copied from the manager at prepare time so the
/// stream never needs a back-pointer to it.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub period_size: usize,
    pub nb_buffers: usize,
    pub nominal_rate: u32,
    pub audio_type: AudioDataType,
    /// Local node id for CIP source fields (6 bits).
    pub local_node_id: u8,
}

impl StreamConfig {
    /// Nominal ticks per frame at the configured rate.
    pub fn nominal_ticks_per_frame(&self) -> f64 {
        firestream_clock::TICKS_PER_SECOND as f64 / self.nominal_rate as f64
    }
}

/// Verdict of a format callback, translated by the stream processor into a
/// bus disposition and/or a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildReturn {
    /// Done, nothing special.
    Ok,
    /// A packet was produced.
    Packet,
    /// A packet was produced, but the producer is running low; the handler
    /// should back off before asking again.
    Defer,
    /// Nothing to send yet; ask again for the same cycle later.
    Again,
    /// Too early for data; an empty packet must go out instead.
    EmptyPacket,
    /// Buffer under/overrun.
    XRun,
    /// The packet is not for us / carries nothing.
    Invalid,
}

/// Receive-side packet metadata handed down from the iso handler.
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub channel: u8,
    pub tag: u8,
    pub sy: u8,
    /// Reconstructed CTR (seconds included) of the receive cycle.
    pub pkt_ctr: u32,
    pub dropped_cycles: u32,
}

/// Transmit-side packet under construction.
pub struct PacketOut<'a> {
    pub data: &'a mut [u8],
    pub length: usize,
    pub tag: u8,
    pub sy: u8,
}

/// What a format callback may reach during packet processing.
pub struct FormatCtx<'a> {
    pub buffer: &'a TimestampedBuffer,
    pub clock: &'a dyn SyncClock,
    pub cfg: &'a StreamConfig,
}

/// Format-specific half of a stream processor.
pub trait PacketFormat: Send {
    /// Allocates format state and the port cache. Fails on inconsistent
    /// port layouts (bad positions, MIDI location out of range).
    fn prepare(&mut self, cfg: &StreamConfig, ports: &[Arc<Port>]) -> Result<()>;

    /// 32-bit subframes per frame ("dimension" for AMDTP).
    fn events_per_frame(&self) -> usize;

    /// Bytes per event on the wire.
    fn event_size(&self) -> usize {
        4
    }

    /// Frames carried per data packet (the SYT interval for AMDTP).
    fn frames_per_packet(&self) -> usize;

    /// Upper bound on the packet size this stream can produce or accept.
    fn max_packet_size(&self) -> usize;

    /// Presentation timestamp extracted from / attached to the last packet.
    fn last_timestamp(&self) -> u64;

    // receive path

    fn process_packet_header(
        &mut self,
        data: &[u8],
        meta: &PacketMeta,
        ctx: &FormatCtx,
    ) -> ChildReturn;

    fn process_packet_data(
        &mut self,
        data: &[u8],
        meta: &PacketMeta,
        ctx: &FormatCtx,
    ) -> ChildReturn;

    // transmit path

    fn generate_packet_header(
        &mut self,
        out: &mut PacketOut,
        cycle: u32,
        dropped_cycles: u32,
        ctx: &FormatCtx,
    ) -> ChildReturn;

    fn generate_packet_data(&mut self, out: &mut PacketOut, cycle: u32, ctx: &FormatCtx)
        -> ChildReturn;

    fn generate_empty_packet(&mut self, out: &mut PacketOut, cycle: u32, ctx: &FormatCtx)
        -> ChildReturn;

    fn generate_silent_packet(&mut self, out: &mut PacketOut, cycle: u32, ctx: &FormatCtx)
        -> ChildReturn;

    // frame-level port de-/multiplexing

    /// Decodes `nframes` wire frames into the client port buffers starting
    /// at port-buffer offset `offset`.
    fn process_read_block(&mut self, data: &[u8], nframes: usize, offset: usize) -> bool;

    /// Encodes `nframes` wire frames from the client port buffers starting
    /// at port-buffer offset `offset`.
    fn process_write_block(&mut self, data: &mut [u8], nframes: usize, offset: usize) -> bool;

    /// Encodes `nframes` of silence.
    fn silence_block(&mut self, data: &mut [u8], nframes: usize, offset: usize) -> bool;
}
