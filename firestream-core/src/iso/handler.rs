//! One isochronous context and its packet callbacks.
//!
//! A handler owns exactly one transmit or receive context and serves exactly
//! one stream processor. The manager's task thread calls `iterate` when the
//! context's descriptor becomes readable; the bus service then invokes the
//! per-packet callbacks, which reconstruct a full cycle timer value for each
//! packet (the kernel only reports the 13-bit cycle) before handing it to
//! the stream.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use firestream_clock::{ctr_cycles, ctr_seconds, diff_cycles};

use crate::bus::{
    IsoContextId, IsoContextParams, IsoDirection, IsoDisposition, IsoPacketClient, IsoSpeed,
    ReceiveMode, SharedBus,
};
use crate::error::{Result, StreamError};
use crate::stream::processor::StreamProcessor;

/// Marker for "no packet handled yet".
pub const CTR_INVALID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    Created = 0,
    Initialized = 1,
    Prepared = 2,
    Running = 3,
    Error = 4,
}

impl HandlerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Prepared,
            3 => Self::Running,
            _ => Self::Error,
        }
    }
}

/// Reconstructs the CTR of a received packet: seconds come from the cached
/// "now" taken just before the loop step. When the cycle field of "now" is
/// behind the packet cycle but still unwrapped-after it, the timer wrapped
/// since reception and one second is stepped back.
pub(crate) fn reconstruct_recv_ctr(last_now: u32, cycle: u32) -> u32 {
    let mut now_secs = ctr_seconds(last_now);
    let now_cycles = ctr_cycles(last_now);
    if now_cycles < cycle && diff_cycles(now_cycles, cycle) >= 0 {
        now_secs = if now_secs == 0 { 127 } else { now_secs - 1 };
    }
    (cycle << 12) | ((now_secs & 0x7F) << 25)
}

/// Transmit counterpart of [`reconstruct_recv_ctr`]: the packet cycle lies
/// in the future, so a "now" cycle ahead of it means the timer will wrap
/// before transmission and one second is stepped forward.
pub(crate) fn reconstruct_xmit_ctr(last_now: u32, cycle: u32) -> u32 {
    let mut now_secs = ctr_seconds(last_now);
    if ctr_cycles(last_now) > cycle {
        now_secs += 1;
    }
    (cycle << 12) | ((now_secs & 0x7F) << 25)
}

/// Owner of one isochronous kernel context.
pub struct IsoHandler {
    direction: IsoDirection,
    bus: SharedBus,
    ctx: Mutex<Option<IsoContextId>>,
    poll_fd: AtomicI64,
    state: AtomicU8,
    client: Mutex<Option<Arc<StreamProcessor>>>,
    buf_packets: u32,
    max_packet_size: u32,
    irq_interval: u32,
    speed: IsoSpeed,
    receive_mode: ReceiveMode,
    prebuffers: AtomicU32,
    last_cycle: AtomicI64,
    last_now: AtomicU32,
    last_packet_handled_at: AtomicU32,
    packets: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
}

impl IsoHandler {
    pub fn new(
        direction: IsoDirection,
        bus: SharedBus,
        buf_packets: u32,
        max_packet_size: u32,
        irq_interval: u32,
        speed: IsoSpeed,
    ) -> Self {
        Self {
            direction,
            bus,
            ctx: Mutex::new(None),
            poll_fd: AtomicI64::new(-1),
            state: AtomicU8::new(HandlerState::Created as u8),
            client: Mutex::new(None),
            buf_packets,
            max_packet_size,
            irq_interval,
            speed,
            receive_mode: ReceiveMode::PacketPerBuffer,
            prebuffers: AtomicU32::new(0),
            last_cycle: AtomicI64::new(-1),
            last_now: AtomicU32::new(CTR_INVALID),
            last_packet_handled_at: AtomicU32::new(CTR_INVALID),
            packets: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> IsoDirection {
        self.direction
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == HandlerState::Running
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    pub fn buf_packets(&self) -> u32 {
        self.buf_packets
    }

    /// Wake-up latency of this context, in cycles.
    pub fn packet_latency(&self) -> u32 {
        self.irq_interval
    }

    pub fn prebuffers(&self) -> u32 {
        self.prebuffers.load(Ordering::Relaxed)
    }

    pub fn set_prebuffers(&self, n: u32) {
        self.prebuffers.store(n, Ordering::Relaxed);
    }

    pub fn poll_descriptor(&self) -> i32 {
        self.poll_fd.load(Ordering::Acquire) as i32
    }

    pub fn in_use(&self) -> bool {
        self.client.lock().is_some()
    }

    pub fn serves_stream(&self, stream: &Arc<StreamProcessor>) -> bool {
        self.client
            .lock()
            .as_ref()
            .map(|c| Arc::ptr_eq(c, stream))
            .unwrap_or(false)
    }

    pub fn register_stream(&self, stream: Arc<StreamProcessor>) -> Result<()> {
        let mut client = self.client.lock();
        if client.is_some() {
            return Err(StreamError::InvalidState("handler already has a client"));
        }
        *client = Some(stream);
        Ok(())
    }

    pub fn unregister_stream(&self, stream: &Arc<StreamProcessor>) -> Result<()> {
        let mut client = self.client.lock();
        match client.as_ref() {
            Some(c) if Arc::ptr_eq(c, stream) => {
                *client = None;
                Ok(())
            }
            _ => Err(StreamError::InvalidState("stream not registered here")),
        }
    }

    pub fn client(&self) -> Option<Arc<StreamProcessor>> {
        self.client.lock().clone()
    }

    pub fn init(&self) -> Result<()> {
        if self.state() != HandlerState::Created {
            return Err(StreamError::InvalidState("handler already initialized"));
        }
        self.state
            .store(HandlerState::Initialized as u8, Ordering::Release);
        Ok(())
    }

    /// Allocates the kernel context for the client's channel.
    pub fn prepare(&self) -> Result<()> {
        match self.state() {
            HandlerState::Initialized => {}
            HandlerState::Prepared => return Ok(()),
            _ => return Err(StreamError::InvalidState("handler not initialized")),
        }
        let channel = self
            .client()
            .ok_or(StreamError::InvalidState("no client registered"))?
            .channel();
        if !(0..64).contains(&channel) {
            return Err(StreamError::Resource(format!(
                "stream has no valid channel ({})",
                channel
            )));
        }
        let params = IsoContextParams {
            direction: self.direction,
            channel: channel as u8,
            speed: self.speed,
            max_packet_size: self.max_packet_size,
            buf_packets: self.buf_packets,
            irq_interval: self.irq_interval,
            receive_mode: self.receive_mode,
        };
        let ctx = self.bus.create_iso_context(&params)?;
        let fd = self.bus.poll_fd(ctx)?;
        *self.ctx.lock() = Some(ctx);
        self.poll_fd.store(fd as i64, Ordering::Release);
        self.state
            .store(HandlerState::Prepared as u8, Ordering::Release);
        Ok(())
    }

    /// Starts the context, optionally at a fixed cycle (-1 = now).
    pub fn enable(&self, cycle: i32) -> Result<()> {
        if self.state() != HandlerState::Prepared {
            return Err(StreamError::InvalidState("handler not prepared"));
        }
        let ctx = (*self.ctx.lock()).ok_or(StreamError::InvalidState("no context"))?;
        self.packets.store(0, Ordering::Relaxed);
        self.last_cycle.store(-1, Ordering::Relaxed);
        self.last_packet_handled_at
            .store(CTR_INVALID, Ordering::Relaxed);
        self.bus.start_iso(ctx, cycle, 0, 0)?;
        self.state
            .store(HandlerState::Running as u8, Ordering::Release);
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        match self.state() {
            HandlerState::Prepared => return Ok(()),
            HandlerState::Running => {}
            _ => return Err(StreamError::InvalidState("handler not running")),
        }
        let ctx = (*self.ctx.lock()).ok_or(StreamError::InvalidState("no context"))?;
        self.bus.stop_iso(ctx)?;
        self.state
            .store(HandlerState::Prepared as u8, Ordering::Release);
        Ok(())
    }

    /// Releases the kernel context.
    pub fn destroy(&self) -> Result<()> {
        if self.state() == HandlerState::Running {
            self.disable()?;
        }
        if let Some(ctx) = self.ctx.lock().take() {
            self.bus.destroy_iso(ctx)?;
        }
        self.poll_fd.store(-1, Ordering::Release);
        self.state
            .store(HandlerState::Initialized as u8, Ordering::Release);
        Ok(())
    }

    /// Drains buffered receive descriptors.
    pub fn flush(&self) {
        if self.direction == IsoDirection::Receive {
            if let Some(ctx) = *self.ctx.lock() {
                let _ = self.bus.flush_iso(ctx);
            }
        }
    }

    /// Advances the context's packet loop by one step. `now_ctr` is cached
    /// so the packet callbacks can reconstruct full timestamps without a
    /// second register read.
    pub fn iterate(&self, now_ctr: u32) -> bool {
        self.last_now.store(now_ctr, Ordering::Release);
        if self.state() != HandlerState::Running {
            log::debug!("not iterating non-running handler");
            return false;
        }
        let ctx = match *self.ctx.lock() {
            Some(ctx) => ctx,
            None => return false,
        };
        let client = match self.client() {
            Some(c) => c,
            None => return false,
        };
        let mut callbacks = HandlerCallbacks {
            handler: self,
            client,
        };
        match self.bus.loop_iterate(ctx, &mut callbacks) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to iterate iso handler: {}", e);
                false
            }
        }
    }

    /// The context died (poll error, kernel shutdown): tell the client and
    /// park in the error state.
    pub fn notify_of_death(&self) {
        self.state.store(HandlerState::Error as u8, Ordering::Release);
        if let Some(client) = self.client() {
            client.handler_died();
        }
    }

    /// Bus reset: invalidate per-packet bookkeeping.
    pub fn handle_bus_reset(&self) {
        self.last_packet_handled_at
            .store(CTR_INVALID, Ordering::Relaxed);
        self.last_cycle.store(-1, Ordering::Relaxed);
    }

    pub fn dump_info(&self) {
        log::debug!(
            "iso handler: dir {:?}, buf {}, maxpkt {}, irq {}, packets {}, dropped {}, skipped {}",
            self.direction,
            self.buf_packets,
            self.max_packet_size,
            self.irq_interval,
            self.packets.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        );
    }
}

struct HandlerCallbacks<'a> {
    handler: &'a IsoHandler,
    client: Arc<StreamProcessor>,
}

impl IsoPacketClient for HandlerCallbacks<'_> {
    fn put_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: u32,
        dropped: u32,
        skipped: u32,
    ) -> IsoDisposition {
        let h = self.handler;

        let last_cycle = h.last_cycle.load(Ordering::Relaxed);
        if last_cycle >= 0 && last_cycle != cycle as i64 {
            let gap = diff_cycles(cycle, last_cycle as u32) - 1;
            if gap > 0 {
                h.dropped.fetch_add(gap as u64, Ordering::Relaxed);
            }
        }
        h.last_cycle.store(cycle as i64, Ordering::Relaxed);

        let pkt_ctr = reconstruct_recv_ctr(h.last_now.load(Ordering::Acquire), cycle);
        h.last_packet_handled_at.store(pkt_ctr, Ordering::Relaxed);
        h.packets.fetch_add(1, Ordering::Relaxed);

        if data.len() > h.max_packet_size as usize {
            log::error!(
                "dropping oversized packet: {} > {} bytes",
                data.len(),
                h.max_packet_size
            );
            return IsoDisposition::Ok;
        }

        self.client
            .put_packet(data, channel, tag, sy, pkt_ctr, dropped, skipped)
    }

    fn get_packet(
        &mut self,
        data: &mut [u8],
        length: &mut usize,
        tag: &mut u8,
        sy: &mut u8,
        cycle: i32,
        dropped: u32,
        skipped: u32,
    ) -> IsoDisposition {
        let h = self.handler;

        if cycle >= 0 {
            let pkt_ctr = reconstruct_xmit_ctr(h.last_now.load(Ordering::Acquire), cycle as u32);
            if h.packets.load(Ordering::Relaxed) < h.buf_packets as u64 {
                // prebuffered packets have no meaningful handling time
                h.last_packet_handled_at
                    .store(CTR_INVALID, Ordering::Relaxed);
            } else {
                h.last_packet_handled_at.store(pkt_ctr, Ordering::Relaxed);
            }
        }
        h.packets.fetch_add(1, Ordering::Relaxed);
        if skipped > 0 {
            h.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        }
        if dropped > 0 {
            // the kernel dropped queued packets; the stream will see the
            // cycle gap and treat it as an xrun
            log::warn!("kernel-side transmit drop: {} packets", dropped);
        }

        let max = (h.max_packet_size as usize).min(data.len());
        let ret = self.client.get_packet(
            &mut data[..max],
            length,
            tag,
            sy,
            cycle,
            dropped,
            skipped,
        );
        if *length > max {
            log::error!("client produced oversized packet, truncating");
            *length = max;
        }
        if cycle >= 0 {
            h.last_cycle.store(cycle as i64, Ordering::Relaxed);
        }
        ret
    }
}
