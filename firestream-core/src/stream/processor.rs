//! Per-stream state machine.
//!
//! A stream processor owns the timestamped buffer of one isochronous stream
//! and converts between packets (iso side) and frames (client side). All
//! state transitions are cycle-aligned: a transition is scheduled for a bus
//! cycle and executed by the packet path the first time it sees that cycle,
//! so enable/disable/startup happen in phase with the wire.
//!
//! ```text
//! Created -> Stopped -> WaitingForStream -> DryRunning
//!     DryRunning -> WaitingForStreamEnable -> Running
//!     Running -> WaitingForStreamDisable -> DryRunning -> Stopped
//! ```
//!
//! While `DryRunning`, a receive stream discards packets and a transmit
//! stream emits no-data packets; the buffer is transparent so the rate DLL
//! keeps tracking without data moving.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use firestream_clock::{
    add_cycles, add_ticks, diff_cycles, diff_ticks, ticks_to_cycles, SyncClock, TICKS_PER_CYCLE,
    TICKS_PER_USEC,
};

use super::format::{ChildReturn, FormatCtx, PacketFormat, PacketMeta, PacketOut, StreamConfig};
use crate::activity::ActivitySignal;
use crate::buffer::TimestampedBuffer;
use crate::bus::IsoDisposition;
use crate::error::{Result, StreamError};
use crate::ports::Port;

/// Default horizon for scheduled starts, in cycles.
const SCHEDULE_START_CYCLES: u32 = 200;
/// Default horizon for scheduled stops, in cycles.
const SCHEDULE_STOP_CYCLES: u32 = 2000;
/// Timeout for waiting on a scheduled transition.
const STATE_WAIT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Transmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Created = 0,
    Stopped = 1,
    WaitingForStream = 2,
    DryRunning = 3,
    WaitingForStreamEnable = 4,
    Running = 5,
    WaitingForStreamDisable = 6,
    Error = 7,
}

impl ProcessorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Stopped,
            2 => Self::WaitingForStream,
            3 => Self::DryRunning,
            4 => Self::WaitingForStreamEnable,
            5 => Self::Running,
            6 => Self::WaitingForStreamDisable,
            _ => Self::Error,
        }
    }
}

struct Core {
    state: ProcessorState,
    next_state: ProcessorState,
    cycle_to_switch: u32,
    last_cycle: i64,
    correct_last_timestamp: bool,
    format: Box<dyn PacketFormat>,
    cfg: Option<StreamConfig>,
    scratch: Vec<u8>,
    ports: Vec<Arc<Port>>,
    last_good_cycle: u32,
    last_dropped: u32,
}

/// One direction of one isochronous stream.
pub struct StreamProcessor {
    direction: Direction,
    channel: AtomicI64,
    clock: Arc<dyn SyncClock>,
    activity: Arc<ActivitySignal>,
    buffer: TimestampedBuffer,
    core: Mutex<Core>,
    state_cell: AtomicU8,
    in_xrun: AtomicBool,
    dropped: AtomicU64,
    sync_delay: AtomicU64,
    client_mutex: Mutex<()>,
    client_cond: Condvar,
}

impl StreamProcessor {
    pub fn new(
        direction: Direction,
        format: Box<dyn PacketFormat>,
        clock: Arc<dyn SyncClock>,
        activity: Arc<ActivitySignal>,
    ) -> Self {
        Self {
            direction,
            channel: AtomicI64::new(-1),
            clock,
            activity,
            buffer: TimestampedBuffer::new(),
            core: Mutex::new(Core {
                state: ProcessorState::Created,
                next_state: ProcessorState::Created,
                cycle_to_switch: 0,
                last_cycle: -1,
                correct_last_timestamp: false,
                format,
                cfg: None,
                scratch: Vec::new(),
                ports: Vec::new(),
                last_good_cycle: 0,
                last_dropped: 0,
            }),
            state_cell: AtomicU8::new(ProcessorState::Created as u8),
            in_xrun: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            sync_delay: AtomicU64::new(0),
            client_mutex: Mutex::new(()),
            client_cond: Condvar::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channel(&self) -> i64 {
        self.channel.load(Ordering::Acquire)
    }

    pub fn set_channel(&self, channel: i64) {
        self.channel.store(channel, Ordering::Release);
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state_cell.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Running
    }

    pub fn is_dry_running(&self) -> bool {
        self.state() == ProcessorState::DryRunning
    }

    pub fn xrun_occurred(&self) -> bool {
        self.in_xrun.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn signal_activity(&self) {
        self.activity.signal();
        self.client_cond.notify_all();
    }

    // --- ports ---

    /// Adds a port; only valid before `prepare`.
    pub fn add_port(&self, port: Arc<Port>) -> Result<()> {
        let mut core = self.core.lock();
        if core.cfg.is_some() {
            return Err(StreamError::InvalidState("ports must be added before prepare"));
        }
        core.ports.push(port);
        Ok(())
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.core.lock().ports.clone()
    }

    pub fn port_count(&self) -> usize {
        self.core.lock().ports.len()
    }

    // --- configuration / preparation ---

    /// Applies the manager configuration: sizes the port buffers, prepares
    /// the format (allocating its port cache), configures the timestamped
    /// buffer and moves `Created -> Stopped`.
    pub fn prepare(&self, cfg: StreamConfig) -> Result<()> {
        let mut core = self.core.lock();

        for port in &core.ports {
            port.set_buffer_size(cfg.period_size);
        }

        {
            let Core { format, ports, .. } = &mut *core;
            format.prepare(&cfg, ports)?;
        }

        let bytes_per_frame = core.format.event_size() * core.format.events_per_frame();
        core.scratch.clear();
        core.scratch.resize(cfg.period_size * bytes_per_frame, 0);

        self.buffer.set_event_size(core.format.event_size());
        self.buffer.set_events_per_frame(core.format.events_per_frame());
        self.buffer
            .set_buffer_size((cfg.nb_buffers + 1) * cfg.period_size);
        self.buffer.set_update_period(match self.direction {
            Direction::Receive => core.format.frames_per_packet(),
            Direction::Transmit => cfg.period_size,
        });
        self.buffer.set_nominal_rate(cfg.nominal_ticks_per_frame());
        self.buffer.prepare()?;
        self.buffer.set_transparent(true);

        core.cfg = Some(cfg);
        core.last_cycle = -1;
        core.next_state = ProcessorState::Stopped;
        self.apply_state_change(&mut core);
        Ok(())
    }

    fn cfg_cloned(&self) -> Option<StreamConfig> {
        self.core.lock().cfg.clone()
    }

    /// The configuration applied at prepare time, if any.
    pub fn config(&self) -> Option<StreamConfig> {
        self.cfg_cloned()
    }

    pub fn max_packet_size(&self) -> usize {
        self.core.lock().format.max_packet_size()
    }

    pub fn frames_per_packet(&self) -> usize {
        self.core.lock().format.frames_per_packet()
    }

    /// Packets needed on the wire for `nframes` at the nominal rate.
    pub fn nominal_packets_needed(&self, nframes: usize) -> Result<usize> {
        let cfg = self
            .cfg_cloned()
            .ok_or(StreamError::InvalidState("stream not prepared"))?;
        let ticks = cfg.nominal_ticks_per_frame() * nframes as f64;
        Ok((ticks / TICKS_PER_CYCLE as f64) as usize)
    }

    pub fn packets_per_period(&self) -> Result<usize> {
        let cfg = self
            .cfg_cloned()
            .ok_or(StreamError::InvalidState("stream not prepared"))?;
        self.nominal_packets_needed(cfg.period_size)
    }

    // --- state machine ---

    /// Applies a pending state change. Call with the core locked.
    fn apply_state_change(&self, core: &mut Core) {
        if core.state == core.next_state {
            return;
        }
        let to = core.next_state;
        log::debug!(
            "{:?} stream: {:?} -> {:?}",
            self.direction,
            core.state,
            to
        );
        match to {
            ProcessorState::Stopped | ProcessorState::DryRunning => {
                self.buffer.clear();
                self.buffer.set_transparent(true);
            }
            ProcessorState::Running => {
                if self.direction == Direction::Receive {
                    self.buffer.clear();
                }
                self.buffer.set_transparent(false);
                self.in_xrun.store(false, Ordering::Release);
            }
            _ => {}
        }
        core.state = to;
        self.state_cell.store(to as u8, Ordering::Release);
        self.signal_activity();
    }

    /// Schedules a transition for the cycle containing `time_ticks`.
    pub fn schedule_state_transition(&self, state: ProcessorState, time_ticks: u64) {
        let mut core = self.core.lock();
        core.cycle_to_switch = ticks_to_cycles(time_ticks);
        core.next_state = state;
        drop(core);
        self.signal_activity();
    }

    /// Blocks until the processor reaches `state` or the timeout expires.
    pub fn wait_for_state(&self, state: ProcessorState, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while self.state() != state {
            if Instant::now() >= deadline {
                return Err(StreamError::Timeout("stream state transition"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn resolve_time(&self, t: i64, default_cycles: u32) -> u64 {
        if t < 0 {
            add_ticks(
                self.clock.now_ticks(),
                default_cycles as u64 * TICKS_PER_CYCLE as u64,
            )
        } else {
            t as u64
        }
    }

    /// Schedules startup into `DryRunning` (via `WaitingForStream`) at `t`
    /// (ticks; -1 = a couple hundred cycles from now). The iso handler must
    /// be enabled separately before the switch cycle.
    pub fn schedule_start_dry_running(&self, t: i64) -> Result<()> {
        let tx = self.resolve_time(t, SCHEDULE_START_CYCLES);
        match self.state() {
            ProcessorState::Stopped => {
                self.schedule_state_transition(ProcessorState::WaitingForStream, tx);
                Ok(())
            }
            ProcessorState::Running => {
                self.schedule_state_transition(ProcessorState::WaitingForStreamDisable, tx);
                Ok(())
            }
            ProcessorState::DryRunning | ProcessorState::WaitingForStreamDisable => Ok(()),
            _ => Err(StreamError::InvalidState("cannot start dry-running from here")),
        }
    }

    pub fn schedule_start_running(&self, t: i64) -> Result<()> {
        let tx = self.resolve_time(t, SCHEDULE_START_CYCLES);
        self.schedule_state_transition(ProcessorState::WaitingForStreamEnable, tx);
        Ok(())
    }

    pub fn schedule_stop_running(&self, t: i64) -> Result<()> {
        let tx = self.resolve_time(t, SCHEDULE_STOP_CYCLES);
        self.schedule_state_transition(ProcessorState::WaitingForStreamDisable, tx);
        Ok(())
    }

    pub fn schedule_stop_dry_running(&self, t: i64) -> Result<()> {
        let tx = self.resolve_time(t, SCHEDULE_STOP_CYCLES);
        self.schedule_state_transition(ProcessorState::Stopped, tx);
        Ok(())
    }

    pub fn start_dry_running(&self, t: i64) -> Result<()> {
        if self.state() == ProcessorState::DryRunning {
            return Ok(());
        }
        self.schedule_start_dry_running(t)?;
        self.wait_for_state(ProcessorState::DryRunning, STATE_WAIT_TIMEOUT_MS)
    }

    pub fn start_running(&self, t: i64) -> Result<()> {
        if self.state() == ProcessorState::Running {
            return Ok(());
        }
        self.schedule_start_running(t)?;
        self.wait_for_state(ProcessorState::Running, STATE_WAIT_TIMEOUT_MS)
    }

    pub fn stop_running(&self, t: i64) -> Result<()> {
        if self.state() == ProcessorState::DryRunning {
            return Ok(());
        }
        self.schedule_stop_running(t)?;
        self.wait_for_state(ProcessorState::DryRunning, STATE_WAIT_TIMEOUT_MS)
    }

    pub fn stop_dry_running(&self, t: i64) -> Result<()> {
        if self.state() == ProcessorState::Stopped {
            return Ok(());
        }
        self.schedule_stop_dry_running(t)?;
        self.wait_for_state(ProcessorState::Stopped, STATE_WAIT_TIMEOUT_MS)
    }

    /// The handler serving this stream died: no more packets will arrive.
    pub fn handler_died(&self) {
        log::warn!("handler died for {:?} stream", self.direction);
        let mut core = self.core.lock();
        core.next_state = ProcessorState::Stopped;
        core.state = ProcessorState::WaitingForStreamDisable; // force the edge
        self.apply_state_change(&mut core);
        drop(core);
        self.in_xrun.store(true, Ordering::Release);
        self.signal_activity();
    }

    /// Bus reset: drop straight to `Stopped`; the packet loop may already
    /// be gone, so this is not cycle-aligned.
    pub fn handle_bus_reset(&self) {
        log::debug!("{:?} stream: bus reset", self.direction);
        let mut core = self.core.lock();
        core.next_state = ProcessorState::Stopped;
        core.state = ProcessorState::WaitingForStreamDisable;
        self.apply_state_change(&mut core);
        core.last_cycle = -1;
        drop(core);
        self.signal_activity();
    }

    // --- packet path (iso task) ---

    /// Receive-path packet entry. `pkt_ctr` carries the reconstructed CTR
    /// of the cycle the packet arrived on.
    pub fn put_packet(
        &self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        pkt_ctr: u32,
        _dropped: u32,
        _skipped: u32,
    ) -> IsoDisposition {
        let cycle = firestream_clock::ctr_cycles(pkt_ctr);
        let mut core = self.core.lock();
        if core.cfg.is_none() {
            return IsoDisposition::Error;
        }

        let mut dropped_cycles: i32 = 0;
        if core.last_cycle >= 0 && core.last_cycle != cycle as i64 {
            dropped_cycles = diff_cycles(cycle, core.last_cycle as u32) - 1;
            if dropped_cycles < 0 {
                log::warn!(
                    "negative cycle gap {} (cycle {}, last {})",
                    dropped_cycles,
                    cycle,
                    core.last_cycle
                );
                dropped_cycles = 0;
            } else if dropped_cycles > 0 {
                log::warn!("dropped {} packets before cycle {}", dropped_cycles, cycle);
                self.dropped.fetch_add(dropped_cycles as u64, Ordering::Relaxed);
            }
        }
        core.last_cycle = cycle as i64;

        match core.state {
            ProcessorState::Created => return IsoDisposition::Defer,
            ProcessorState::Error => return IsoDisposition::Error,
            _ => {}
        }

        // cycle-aligned switching
        if core.state == ProcessorState::WaitingForStreamDisable {
            if diff_cycles(cycle, core.cycle_to_switch) >= 0 {
                core.next_state = ProcessorState::DryRunning;
                self.apply_state_change(&mut core);
            }
            // data is discarded while waiting for the disable
            return IsoDisposition::Ok;
        } else if core.state == ProcessorState::WaitingForStreamEnable
            && diff_cycles(cycle, core.cycle_to_switch) >= 0
        {
            core.next_state = ProcessorState::Running;
            self.apply_state_change(&mut core);
        }

        let meta = PacketMeta {
            channel,
            tag,
            sy,
            pkt_ctr,
            dropped_cycles: dropped_cycles as u32,
        };

        let result = {
            let Core { format, cfg, .. } = &mut *core;
            let ctx = FormatCtx {
                buffer: &self.buffer,
                clock: self.clock.as_ref(),
                cfg: cfg.as_ref().unwrap(),
            };
            format.process_packet_header(data, &meta, &ctx)
        };

        if dropped_cycles > 0 {
            core.correct_last_timestamp = true;
            if core.state == ProcessorState::Running {
                self.in_xrun.store(true, Ordering::Release);
                log::warn!("xrun due to dropped packets at cycle {}", cycle);
                core.cycle_to_switch = add_cycles(cycle, 1);
                core.next_state = ProcessorState::WaitingForStreamDisable;
                self.apply_state_change(&mut core);
                self.signal_activity();
                return IsoDisposition::Defer;
            }
        }

        match result {
            ChildReturn::Ok => {
                core.last_good_cycle = cycle;
                core.last_dropped = dropped_cycles as u32;

                if core.correct_last_timestamp {
                    // a discontinuity passed; reseed so the next write does
                    // not slew the DLL across the gap
                    self.buffer
                        .set_buffer_tail_timestamp(core.format.last_timestamp());
                    core.correct_last_timestamp = false;
                }

                if core.state == ProcessorState::WaitingForStream {
                    // a valid header means the stream is alive
                    if diff_cycles(cycle, core.cycle_to_switch) >= 0 {
                        core.next_state = ProcessorState::DryRunning;
                        self.apply_state_change(&mut core);
                    }
                    return IsoDisposition::Ok;
                }

                if core.state != core.next_state {
                    self.apply_state_change(&mut core);
                }

                let result2 = {
                    let Core { format, cfg, .. } = &mut *core;
                    let ctx = FormatCtx {
                        buffer: &self.buffer,
                        clock: self.clock.as_ref(),
                        cfg: cfg.as_ref().unwrap(),
                    };
                    format.process_packet_data(data, &meta, &ctx)
                };

                match result2 {
                    ChildReturn::Ok => {
                        drop(core);
                        self.signal_activity();
                        IsoDisposition::Ok
                    }
                    ChildReturn::XRun => {
                        log::warn!("data xrun at cycle {}", cycle);
                        self.in_xrun.store(true, Ordering::Release);
                        core.cycle_to_switch = add_cycles(cycle, 1);
                        core.next_state = ProcessorState::WaitingForStreamDisable;
                        self.apply_state_change(&mut core);
                        drop(core);
                        self.signal_activity();
                        IsoDisposition::Defer
                    }
                    _ => IsoDisposition::Error,
                }
            }
            ChildReturn::Invalid => IsoDisposition::Ok,
            ChildReturn::XRun => {
                // protocol error, escalated
                if core.state == ProcessorState::Running {
                    self.in_xrun.store(true, Ordering::Release);
                    core.cycle_to_switch = add_cycles(cycle, 1);
                    core.next_state = ProcessorState::WaitingForStreamDisable;
                    self.apply_state_change(&mut core);
                    self.signal_activity();
                }
                IsoDisposition::Ok
            }
            _ => IsoDisposition::Error,
        }
    }

    /// Transmit-path packet entry: fills `data` for `cycle`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_packet(
        &self,
        data: &mut [u8],
        length: &mut usize,
        tag: &mut u8,
        sy: &mut u8,
        cycle: i32,
        _dropped: u32,
        skipped: u32,
    ) -> IsoDisposition {
        if cycle < 0 {
            *length = 0;
            *tag = 0;
            *sy = 0;
            return IsoDisposition::Ok;
        }
        let cycle = cycle as u32 & 0x1FFF;
        let mut core = self.core.lock();
        if core.cfg.is_none() {
            return IsoDisposition::Error;
        }

        let mut dropped_cycles: i32 = 0;
        let mut drop_xrun = false;
        if core.last_cycle >= 0 && core.last_cycle != cycle as i64 {
            dropped_cycles = diff_cycles(cycle, core.last_cycle as u32) - 1 - skipped as i32;
            if dropped_cycles < 0 {
                dropped_cycles = 0;
            } else if dropped_cycles > 0 {
                log::warn!("dropped {} xmit packets before cycle {}", dropped_cycles, cycle);
                self.dropped.fetch_add(dropped_cycles as u64, Ordering::Relaxed);
                self.in_xrun.store(true, Ordering::Release);
                if core.state == ProcessorState::Running {
                    core.cycle_to_switch = add_cycles(cycle, 1);
                    core.next_state = ProcessorState::WaitingForStreamDisable;
                    self.apply_state_change(&mut core);
                    drop_xrun = true;
                }
            }
        }
        core.last_cycle = cycle as i64;

        if core.state == ProcessorState::Created {
            *length = 0;
            *tag = 0;
            *sy = 0;
            return IsoDisposition::Defer;
        }
        if core.state == ProcessorState::Error {
            return IsoDisposition::Error;
        }

        // packets are queued ahead of time; make sure the requested cycle
        // is not already in the past
        let now_cycles = ticks_to_cycles(self.clock.now_ticks());
        let cycle_diff = diff_cycles(cycle, now_cycles);
        if cycle_diff < 0 && core.state == ProcessorState::Running && !drop_xrun {
            log::warn!(
                "packet for cycle {:04} requested in the past (now {:04})",
                cycle,
                now_cycles
            );
            self.in_xrun.store(true, Ordering::Release);
            core.cycle_to_switch = add_cycles(cycle, 1);
            core.next_state = ProcessorState::WaitingForStreamDisable;
            self.apply_state_change(&mut core);
            drop_xrun = true;
        }

        if drop_xrun {
            self.signal_activity();
            return self.emit_empty_packet(&mut core, data, length, tag, sy, cycle);
        }

        if core.state == ProcessorState::WaitingForStreamDisable {
            if diff_cycles(cycle, core.cycle_to_switch) >= 0 {
                core.next_state = ProcessorState::DryRunning;
                self.apply_state_change(&mut core);
            }
            let mut out = PacketOut {
                data,
                length: 0,
                tag: 0,
                sy: 0,
            };
            let ret = {
                let Core { format, cfg, .. } = &mut *core;
                let ctx = FormatCtx {
                    buffer: &self.buffer,
                    clock: self.clock.as_ref(),
                    cfg: cfg.as_ref().unwrap(),
                };
                format.generate_silent_packet(&mut out, cycle, &ctx)
            };
            *length = out.length;
            *tag = out.tag;
            *sy = out.sy;
            return match ret {
                ChildReturn::Packet | ChildReturn::Ok => IsoDisposition::Ok,
                _ => IsoDisposition::Error,
            };
        } else if core.state == ProcessorState::WaitingForStreamEnable {
            if diff_cycles(cycle, core.cycle_to_switch) >= 0 {
                core.next_state = ProcessorState::Running;
                self.apply_state_change(&mut core);
            }
        } else if core.state == ProcessorState::WaitingForStream
            && cycle_diff >= 0
            && diff_cycles(cycle, core.cycle_to_switch) >= 0
        {
            core.next_state = ProcessorState::DryRunning;
            self.apply_state_change(&mut core);
        }

        if core.state == ProcessorState::Running {
            let mut out = PacketOut {
                data,
                length: 0,
                tag: 0,
                sy: 0,
            };
            let ret = {
                let Core { format, cfg, .. } = &mut *core;
                let ctx = FormatCtx {
                    buffer: &self.buffer,
                    clock: self.clock.as_ref(),
                    cfg: cfg.as_ref().unwrap(),
                };
                format.generate_packet_header(&mut out, cycle, dropped_cycles as u32, &ctx)
            };
            match ret {
                ChildReturn::Packet | ChildReturn::Defer => {
                    core.last_good_cycle = cycle;
                    core.last_dropped = dropped_cycles as u32;
                    if core.state != core.next_state {
                        self.apply_state_change(&mut core);
                    }
                    let ret2 = {
                        let Core { format, cfg, .. } = &mut *core;
                        let ctx = FormatCtx {
                            buffer: &self.buffer,
                            clock: self.clock.as_ref(),
                            cfg: cfg.as_ref().unwrap(),
                        };
                        format.generate_packet_data(&mut out, cycle, &ctx)
                    };
                    *length = out.length;
                    *tag = out.tag;
                    *sy = out.sy;
                    match ret2 {
                        ChildReturn::XRun => {
                            log::warn!("xmit data xrun at cycle {}", cycle);
                            self.in_xrun.store(true, Ordering::Release);
                            core.cycle_to_switch = add_cycles(cycle, 1);
                            core.next_state = ProcessorState::WaitingForStreamDisable;
                            self.apply_state_change(&mut core);
                            self.signal_activity();
                            self.emit_empty_packet(&mut core, out.data, length, tag, sy, cycle)
                        }
                        _ => {
                            drop(core);
                            self.signal_activity();
                            if ret == ChildReturn::Defer {
                                IsoDisposition::Defer
                            } else {
                                IsoDisposition::Ok
                            }
                        }
                    }
                }
                ChildReturn::XRun => {
                    log::warn!("xmit header xrun at cycle {}", cycle);
                    self.in_xrun.store(true, Ordering::Release);
                    core.cycle_to_switch = add_cycles(cycle, 1);
                    core.next_state = ProcessorState::WaitingForStreamDisable;
                    self.apply_state_change(&mut core);
                    self.signal_activity();
                    let data = out.data;
                    self.emit_empty_packet(&mut core, data, length, tag, sy, cycle)
                }
                ChildReturn::EmptyPacket => {
                    if core.state != core.next_state {
                        self.apply_state_change(&mut core);
                    }
                    let data = out.data;
                    self.emit_empty_packet(&mut core, data, length, tag, sy, cycle)
                }
                ChildReturn::Again => {
                    if core.state != core.next_state {
                        self.apply_state_change(&mut core);
                    }
                    let data = out.data;
                    let _ = self.emit_empty_packet(&mut core, data, length, tag, sy, cycle);
                    IsoDisposition::Defer
                }
                _ => IsoDisposition::Error,
            }
        } else {
            // not running: every cycle gets a well-formed empty packet.
            // pending transitions that are not cycle-synchronized (e.g.
            // Stopped -> WaitingForStream) are applied here.
            if core.state != core.next_state {
                self.apply_state_change(&mut core);
            }
            self.emit_empty_packet(&mut core, data, length, tag, sy, cycle)
        }
    }

    fn emit_empty_packet(
        &self,
        core: &mut Core,
        data: &mut [u8],
        length: &mut usize,
        tag: &mut u8,
        sy: &mut u8,
        cycle: u32,
    ) -> IsoDisposition {
        let mut out = PacketOut {
            data,
            length: 0,
            tag: 0,
            sy: 0,
        };
        let ret = {
            let Core { format, cfg, .. } = &mut *core;
            let ctx = FormatCtx {
                buffer: &self.buffer,
                clock: self.clock.as_ref(),
                cfg: cfg.as_ref().unwrap(),
            };
            format.generate_empty_packet(&mut out, cycle, &ctx)
        };
        *length = out.length;
        *tag = out.tag;
        *sy = out.sy;
        match ret {
            ChildReturn::Ok | ChildReturn::Packet => IsoDisposition::Ok,
            _ => IsoDisposition::Error,
        }
    }

    // --- frame path (client thread) ---

    /// Moves one block of received frames into the client ports; while
    /// dry-running, delivers silence instead.
    pub fn get_frames(&self, nbframes: usize, _ts: u64) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Receive);
        let result = if self.state() == ProcessorState::Running {
            let mut core = self.core.lock();
            let Core { format, .. } = &mut *core;
            self.buffer
                .block_process_read_frames(nbframes, &mut |data, n, off| {
                    format.process_read_block(data, n, off)
                })
        } else {
            self.provide_silence_to_ports(nbframes);
            Ok(())
        };
        self.signal_activity();
        result
    }

    /// Moves one block of client frames into the transmit buffer; while
    /// dry-running, discards them.
    pub fn put_frames(&self, nbframes: usize, ts: u64) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Transmit);
        let result = if self.state() == ProcessorState::Running {
            let mut core = self.core.lock();
            let Core { format, .. } = &mut *core;
            self.buffer
                .block_process_write_frames(nbframes, ts, &mut |data, n, off| {
                    format.process_write_block(data, n, off)
                })
        } else {
            Ok(())
        };
        self.signal_activity();
        result
    }

    /// Writes `nbframes` of silence into the transmit buffer (priming and
    /// xrun recovery).
    pub fn put_silence_frames(&self, nbframes: usize, ts: u64) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Transmit);
        let mut core = self.core.lock();
        let bytes_per_frame = core.format.event_size() * core.format.events_per_frame();
        if nbframes * bytes_per_frame > core.scratch.len() {
            return Err(StreamError::InvalidState("silence block exceeds scratch"));
        }
        let Core { format, scratch, .. } = &mut *core;
        if !format.silence_block(scratch, nbframes, 0) {
            return Err(StreamError::XRun("could not prepare silence block"));
        }
        let result = self.buffer.write_frames(nbframes, scratch, ts);
        drop(core);
        self.signal_activity();
        result
    }

    /// Drops received frames without delivering them.
    pub fn drop_frames(&self, nbframes: usize) -> Result<()> {
        let result = self.buffer.drop_frames(nbframes);
        self.signal_activity();
        result
    }

    /// Phase adjustment: positive drops frames, negative inserts silence.
    pub fn shift_stream(&self, nbframes: i64) -> Result<()> {
        if nbframes == 0 {
            return Ok(());
        }
        let result = if nbframes > 0 {
            self.buffer.drop_frames(nbframes as usize)
        } else {
            for _ in 0..(-nbframes) {
                self.buffer.write_dummy_frame()?;
            }
            Ok(())
        };
        self.signal_activity();
        result
    }

    fn provide_silence_to_ports(&self, nbframes: usize) {
        let core = self.core.lock();
        for port in &core.ports {
            if !port.is_enabled() {
                continue;
            }
            // zero is silence for Int24, Float and MIDI slots alike
            port.with_buffer_mut(|buf| {
                let n = nbframes.min(buf.len());
                buf[..n].fill(0);
            });
        }
    }

    // --- client-side queries ---

    pub fn buffer_fill(&self) -> usize {
        self.buffer.frame_counter()
    }

    pub fn ticks_per_frame(&self) -> f64 {
        self.buffer.ticks_per_frame()
    }

    pub fn set_ticks_per_frame(&self, tpf: f64) {
        self.buffer.set_ticks_per_frame(tpf);
    }

    pub fn set_buffer_head_timestamp(&self, ts: u64) {
        self.buffer.set_buffer_head_timestamp(ts);
    }

    pub fn set_buffer_tail_timestamp(&self, ts: u64) {
        self.buffer.set_buffer_tail_timestamp(ts);
    }

    pub fn set_sync_delay(&self, ticks: u64) {
        self.sync_delay.store(ticks, Ordering::Release);
    }

    pub fn sync_delay(&self) -> u64 {
        self.sync_delay.load(Ordering::Acquire)
    }

    /// Whether the client could move `nbframes` right now.
    pub fn can_client_transfer_frames(&self, nbframes: usize) -> bool {
        match self.direction {
            Direction::Receive => self.buffer.frame_counter() >= nbframes,
            Direction::Transmit => {
                self.buffer.buffer_size() - self.buffer.frame_counter() > nbframes
                    || self.buffer.is_transparent()
            }
        }
    }

    pub fn can_consume_period(&self) -> bool {
        let period = self.cfg_cloned().map(|c| c.period_size).unwrap_or(0);
        match self.state() {
            ProcessorState::Running => self.can_client_transfer_frames(period),
            // dry-running periods are silence and always available
            _ => true,
        }
    }

    pub fn can_produce_period(&self) -> bool {
        let period = self.cfg_cloned().map(|c| c.period_size).unwrap_or(0);
        match self.state() {
            ProcessorState::Running => self.can_client_transfer_frames(period),
            _ => true,
        }
    }

    /// Whether the packet loop can usefully service this stream right now.
    pub fn packets_ready(&self) -> bool {
        let fpp = self.frames_per_packet().max(1);
        match self.direction {
            Direction::Transmit => {
                if self.state() != ProcessorState::Running {
                    return true;
                }
                self.buffer.frame_counter() >= fpp
            }
            Direction::Receive => {
                self.buffer.is_transparent()
                    || self.buffer.buffer_size() - self.buffer.frame_counter() >= fpp
            }
        }
    }

    /// Blocks the iso task until this stream becomes serviceable.
    pub fn wait_for_packets_ready(&self, timeout: Duration) -> bool {
        let mut guard = self.client_mutex.lock();
        let deadline = Instant::now() + timeout;
        while !self.packets_ready() {
            if self
                .client_cond
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.packets_ready();
            }
        }
        true
    }

    // --- timing contract ---

    /// The bus time at which the next period becomes available: the head
    /// timestamp plus one period for receive, the tail minus the already
    /// buffered periods for transmit.
    pub fn time_at_period(&self) -> u64 {
        let cfg = match self.cfg_cloned() {
            Some(cfg) => cfg,
            None => return 0,
        };
        match self.direction {
            Direction::Receive => self.buffer.timestamp_from_head(cfg.period_size),
            Direction::Transmit => self
                .buffer
                .timestamp_from_tail((cfg.nb_buffers - 1) * cfg.period_size),
        }
    }

    /// Host-relative time until the next period signal, in microseconds.
    /// Monotonically decreasing within one period.
    pub fn time_until_next_period_signal_usecs(&self) -> i64 {
        let tap = add_ticks(self.time_at_period(), self.sync_delay());
        let now = self.clock.now_ticks();
        (diff_ticks(tap, now) as f64 / TICKS_PER_USEC) as i64
    }

    /// Presentation timestamp of the last processed packet.
    pub fn last_timestamp(&self) -> u64 {
        self.core.lock().format.last_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdtp::packet::{CipHeader, CIP_HEADER_SIZE, TAG_WITH_CIP};
    use crate::amdtp::{AmdtpReceive, AmdtpTransmit, AMDTP_MAX_PACKET_SIZE};
    use crate::ports::{Port, PortDirection};
    use crate::stream::format::AudioDataType;
    use crate::testing::MockClock;
    use firestream_clock::{ticks_to_ctr, ticks_to_syt};

    const DIM: usize = 2;

    fn cfg() -> StreamConfig {
        StreamConfig {
            period_size: 16,
            nb_buffers: 3,
            nominal_rate: 48_000,
            audio_type: AudioDataType::Int24,
            local_node_id: 2,
        }
    }

    fn receive_sp(clock: Arc<MockClock>) -> StreamProcessor {
        let sp = StreamProcessor::new(
            Direction::Receive,
            Box::new(AmdtpReceive::new(DIM)),
            clock,
            Arc::new(ActivitySignal::new()),
        );
        for i in 0..DIM as u32 {
            sp.add_port(Arc::new(Port::new_audio(
                format!("in_{}", i),
                PortDirection::Capture,
                i,
            )))
            .unwrap();
        }
        sp.prepare(cfg()).unwrap();
        sp
    }

    fn transmit_sp(clock: Arc<MockClock>) -> StreamProcessor {
        let sp = StreamProcessor::new(
            Direction::Transmit,
            Box::new(AmdtpTransmit::new(DIM)),
            clock,
            Arc::new(ActivitySignal::new()),
        );
        for i in 0..DIM as u32 {
            sp.add_port(Arc::new(Port::new_audio(
                format!("out_{}", i),
                PortDirection::Playback,
                i,
            )))
            .unwrap();
        }
        sp.prepare(cfg()).unwrap();
        sp
    }

    fn cycle_ticks(cycle: u64) -> u64 {
        cycle * TICKS_PER_CYCLE as u64
    }

    fn rx_packet(cycle: u32, dbc: u8) -> Vec<u8> {
        let presentation = cycle_ticks(cycle as u64 + 3) + 100;
        let syt = ticks_to_syt(presentation);
        let mut pkt = vec![0u8; CIP_HEADER_SIZE + 8 * DIM * 4];
        CipHeader::data(7, DIM as u8, dbc, 0x02, syt).write_to(&mut pkt);
        for (i, b) in pkt[CIP_HEADER_SIZE..].iter_mut().enumerate() {
            *b = if i % 4 == 0 { 0x40 } else { i as u8 };
        }
        pkt
    }

    fn put_rx(sp: &StreamProcessor, cycle: u32, dbc: u8) -> IsoDisposition {
        let pkt = rx_packet(cycle, dbc);
        sp.put_packet(
            &pkt,
            0,
            TAG_WITH_CIP,
            0,
            ticks_to_ctr(cycle_ticks(cycle as u64)),
            0,
            0,
        )
    }

    #[test]
    fn test_receive_startup_sequence() {
        let clock = Arc::new(MockClock::new(0));
        let sp = receive_sp(clock.clone());
        assert_eq!(sp.state(), ProcessorState::Stopped);

        // schedule startup for cycle 100
        sp.schedule_state_transition(ProcessorState::WaitingForStream, cycle_ticks(100));
        assert_eq!(sp.state(), ProcessorState::Stopped);

        // the first packet applies the pending transition, the next good
        // header past the switch cycle brings the stream to DryRunning
        assert_eq!(put_rx(&sp, 101, 0), IsoDisposition::Ok);
        assert_eq!(sp.state(), ProcessorState::WaitingForStream);
        assert_eq!(put_rx(&sp, 102, 8), IsoDisposition::Ok);
        assert_eq!(sp.state(), ProcessorState::DryRunning);
        // dry-running discards: no frames accumulate
        assert_eq!(sp.buffer_fill(), 0);

        // schedule enable for cycle 110; the switch executes on the first
        // packet seen at or past that cycle
        sp.schedule_state_transition(ProcessorState::WaitingForStreamEnable, cycle_ticks(110));
        assert_eq!(put_rx(&sp, 112, 16), IsoDisposition::Ok);
        assert_eq!(sp.state(), ProcessorState::WaitingForStreamEnable);
        assert_eq!(put_rx(&sp, 113, 24), IsoDisposition::Ok);
        assert_eq!(sp.state(), ProcessorState::Running);
        // the enabling packet is processed wet
        assert_eq!(sp.buffer_fill(), 8);
    }

    fn running_receive_sp(clock: Arc<MockClock>) -> StreamProcessor {
        let sp = receive_sp(clock);
        sp.schedule_state_transition(ProcessorState::WaitingForStream, cycle_ticks(10));
        put_rx(&sp, 11, 0);
        put_rx(&sp, 12, 8);
        sp.schedule_state_transition(ProcessorState::WaitingForStreamEnable, cycle_ticks(13));
        put_rx(&sp, 14, 16);
        put_rx(&sp, 15, 24);
        assert_eq!(sp.state(), ProcessorState::Running);
        assert_eq!(sp.buffer_fill(), 8);
        sp
    }

    #[test]
    fn test_receive_dropped_cycle_causes_xrun() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        put_rx(&sp, 16, 32);
        assert!(!sp.xrun_occurred());

        // cycle 17 never arrives
        put_rx(&sp, 18, 48);
        assert!(sp.xrun_occurred());
        assert_eq!(sp.state(), ProcessorState::WaitingForStreamDisable);

        // the next packet executes the scheduled disable
        put_rx(&sp, 19, 56);
        assert_eq!(sp.state(), ProcessorState::DryRunning);
    }

    #[test]
    fn test_receive_frames_reach_ports() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        put_rx(&sp, 16, 32);
        assert_eq!(sp.buffer_fill(), 16);

        sp.get_frames(16, 0).unwrap();
        assert_eq!(sp.buffer_fill(), 0);
        let ports = sp.ports();
        // payload bytes 1,2,3 of the first event of the first packet
        let expected = u32::from_be_bytes([0, 1, 2, 3]);
        assert_eq!(ports[0].with_buffer(|b| b[0]), expected);
    }

    #[test]
    fn test_receive_dry_running_delivers_silence() {
        let clock = Arc::new(MockClock::new(0));
        let sp = receive_sp(clock);
        sp.ports()[0].with_buffer_mut(|b| b.fill(0xDEAD));
        sp.get_frames(16, 0).unwrap();
        assert_eq!(sp.ports()[0].with_buffer(|b| b[0]), 0);
    }

    fn get_tx(
        sp: &StreamProcessor,
        cycle: i32,
    ) -> (IsoDisposition, Vec<u8>, usize) {
        let mut data = vec![0u8; AMDTP_MAX_PACKET_SIZE];
        let mut length = 0;
        let mut tag = 0;
        let mut sy = 0;
        let ret = sp.get_packet(&mut data, &mut length, &mut tag, &mut sy, cycle, 0, 0);
        (ret, data, length)
    }

    #[test]
    fn test_transmit_not_running_emits_empty_packets() {
        let clock = Arc::new(MockClock::new(cycle_ticks(50)));
        let sp = transmit_sp(clock);
        let (ret, data, length) = get_tx(&sp, 51);
        assert_eq!(ret, IsoDisposition::Ok);
        assert_eq!(length, CIP_HEADER_SIZE + 8 * DIM * 4);
        assert!(CipHeader::parse(&data).unwrap().is_no_data());
    }

    #[test]
    fn test_transmit_startup_and_data() {
        let clock = Arc::new(MockClock::new(cycle_ticks(50)));
        let sp = transmit_sp(clock.clone());

        // Stopped -> WaitingForStream -> DryRunning through the packet loop
        sp.schedule_state_transition(ProcessorState::WaitingForStream, cycle_ticks(60));
        let _ = get_tx(&sp, 61);
        assert_eq!(sp.state(), ProcessorState::WaitingForStream);
        let _ = get_tx(&sp, 62);
        assert_eq!(sp.state(), ProcessorState::DryRunning);

        // seed the buffer head out at cycle 200 and go live at 100
        sp.set_buffer_head_timestamp(cycle_ticks(200));
        sp.schedule_state_transition(ProcessorState::WaitingForStreamEnable, cycle_ticks(100));
        clock.set_ticks(cycle_ticks(100));
        let _ = get_tx(&sp, 101);
        let (ret, data, _) = get_tx(&sp, 102);
        assert_eq!(sp.state(), ProcessorState::Running);
        // no client data yet, presentation far away: empty packet, deferred
        assert_eq!(ret, IsoDisposition::Defer);
        assert!(CipHeader::parse(&data).unwrap().is_no_data());

        // client provides a period of frames presented around cycle 200
        sp.put_frames(16, cycle_ticks(200) + (16.0 * 512.0) as u64)
            .unwrap();
        assert_eq!(sp.buffer_fill(), 16);

        // inside the transmit window (presentation 200, transfer delay 3,
        // early window 15): cycle 190 qualifies
        clock.set_ticks(cycle_ticks(189));
        let (ret, data, length) = get_tx(&sp, 190);
        assert!(matches!(ret, IsoDisposition::Ok | IsoDisposition::Defer));
        let hdr = CipHeader::parse(&data).unwrap();
        assert!(!hdr.is_no_data());
        assert_eq!(length, CIP_HEADER_SIZE + 8 * DIM * 4);
        assert_eq!(sp.buffer_fill(), 8);
    }

    #[test]
    fn test_transmit_past_cycle_is_xrun() {
        let clock = Arc::new(MockClock::new(cycle_ticks(50)));
        let sp = transmit_sp(clock.clone());
        sp.schedule_state_transition(ProcessorState::WaitingForStream, cycle_ticks(60));
        let _ = get_tx(&sp, 61);
        let _ = get_tx(&sp, 62);
        sp.set_buffer_head_timestamp(cycle_ticks(200));
        sp.schedule_state_transition(ProcessorState::WaitingForStreamEnable, cycle_ticks(100));
        clock.set_ticks(cycle_ticks(100));
        let _ = get_tx(&sp, 101);
        let _ = get_tx(&sp, 102);
        assert_eq!(sp.state(), ProcessorState::Running);

        // the kernel asks for the very next cycle, but time has moved on
        clock.set_ticks(cycle_ticks(120));
        let (ret, data, _) = get_tx(&sp, 103);
        assert!(sp.xrun_occurred());
        assert_eq!(ret, IsoDisposition::Ok);
        assert!(CipHeader::parse(&data).unwrap().is_no_data());
        assert_eq!(sp.state(), ProcessorState::WaitingForStreamDisable);
    }

    #[test]
    fn test_shift_stream() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        put_rx(&sp, 16, 32);
        assert_eq!(sp.buffer_fill(), 16);
        sp.shift_stream(4).unwrap();
        assert_eq!(sp.buffer_fill(), 12);
        sp.shift_stream(-2).unwrap();
        assert_eq!(sp.buffer_fill(), 14);
    }

    #[test]
    fn test_time_at_period_receive() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        put_rx(&sp, 16, 32);
        let (head, _) = (sp.buffer.head_timestamp().0, ());
        let tap = sp.time_at_period();
        let expect = add_ticks(head, (16.0 * sp.ticks_per_frame()) as u64);
        assert!(diff_ticks(tap, expect).abs() <= 1);
    }

    #[test]
    fn test_time_until_period_decreases() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock.clone());
        put_rx(&sp, 16, 32);
        clock.set_ticks(cycle_ticks(17));
        let t1 = sp.time_until_next_period_signal_usecs();
        clock.advance(3072);
        let t2 = sp.time_until_next_period_signal_usecs();
        assert!(t2 < t1);
    }

    #[test]
    fn test_put_silence_frames_primes_buffer() {
        let clock = Arc::new(MockClock::new(0));
        let sp = transmit_sp(clock);
        sp.buffer.set_transparent(false);
        sp.put_silence_frames(16, cycle_ticks(100)).unwrap();
        assert_eq!(sp.buffer_fill(), 16);
    }

    #[test]
    fn test_can_transfer_and_readiness() {
        let clock = Arc::new(MockClock::new(0));
        let rx = running_receive_sp(clock.clone());
        assert!(!rx.can_consume_period()); // 8 frames buffered, period 16
        put_rx(&rx, 16, 32);
        assert!(rx.can_consume_period());

        let tx = transmit_sp(clock);
        // not running: the packet loop can always service it
        assert!(tx.packets_ready());
    }

    #[test]
    fn test_handler_death_stops_stream() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        sp.handler_died();
        assert_eq!(sp.state(), ProcessorState::Stopped);
        assert!(sp.xrun_occurred());
    }

    #[test]
    fn test_bus_reset_drops_to_stopped() {
        let clock = Arc::new(MockClock::new(0));
        let sp = running_receive_sp(clock);
        sp.handle_bus_reset();
        assert_eq!(sp.state(), ProcessorState::Stopped);
        assert!(sp.buffer.is_transparent());
    }
}
