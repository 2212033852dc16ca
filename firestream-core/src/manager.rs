//! Period-driven coordination of all streams.
//!
//! The manager starts every stream against the same bus time so they run in
//! phase, signals period boundaries to the client (`wait_for_period`), and
//! moves one period at a time between the stream buffers and the client
//! port buffers (`transfer`). One stream is the sync source; its buffer
//! timestamps define when a period is due, and every other stream is phase
//! aligned to it at startup.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use firestream_clock::{add_ticks, diff_ticks, sub_ticks, ticks_to_cycles, SyncClock,
    TICKS_PER_CYCLE};

use crate::activity::{ActivityResult, ActivitySignal};
use crate::bus::SharedBus;
use crate::error::{Result, StreamError};
use crate::iso::manager::IsoHandlerManager;
use crate::ports::{Port, PortDirection};
use crate::stream::format::{AudioDataType, StreamConfig};
use crate::stream::processor::{Direction, ProcessorState, StreamProcessor};

/// Window between reading the sync source's time and the scheduled start of
/// wet-running, in cycles. Everything must be set up within it.
const CYCLES_FOR_STARTUP: u32 = 2000;
/// Transmit streams go wet this many cycles before the first sample.
const PRESTART_CYCLES_FOR_XMIT: u32 = 20;
/// Receive counterpart.
const PRESTART_CYCLES_FOR_RECV: u32 = 0;
/// Processing margin added to the measured wake-up latency.
const SIGNAL_DELAY_TICKS: u64 = 6 * TICKS_PER_CYCLE as u64;
/// How long the sync source dry-runs before its rate estimate is trusted.
const SYNC_WAIT_TIME_MSEC: u64 = 200;
/// Averaging window of one alignment round.
const ALIGN_AVERAGE_TIME_MSEC: u64 = 200;
/// Alignment rounds before giving up.
const NB_ALIGN_TRIES: u32 = 40;
/// Complete sync-start attempts before giving up.
const SYNCSTART_TRIES: u32 = 10;
/// Default client wait timeout.
const ACTIVITY_TIMEOUT_USECS: u64 = 1_000_000;

/// Scheduling horizon for dry-running starts, in cycles.
const DRY_START_CYCLES: u32 = 200;
/// The handler is enabled this many cycles before the stream switch.
const DRY_START_HANDLER_LEAD_CYCLES: u32 = 100;

#[derive(Debug, Clone)]
struct ManagerConfig {
    period_size: usize,
    nb_buffers: usize,
    nominal_rate: u32,
    audio_type: AudioDataType,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            period_size: 1024,
            nb_buffers: 3,
            nominal_rate: 48_000,
            audio_type: AudioDataType::Int24,
        }
    }
}

/// The client-facing coordinator.
pub struct StreamProcessorManager {
    bus: SharedBus,
    clock: Arc<dyn SyncClock>,
    iso: Arc<IsoHandlerManager>,
    activity: Arc<ActivitySignal>,
    cfg: Mutex<ManagerConfig>,
    receive: Mutex<Vec<Arc<StreamProcessor>>>,
    transmit: Mutex<Vec<Arc<StreamProcessor>>>,
    sync_source: Mutex<Option<Arc<StreamProcessor>>>,
    time_of_transfer: AtomicU64,
    shutdown_needed: AtomicBool,
    nb_periods: AtomicU64,
    delayed_usecs: AtomicI64,
    activity_timeout_usecs: AtomicU64,
    wait_lock: Mutex<()>,
}

impl StreamProcessorManager {
    pub fn new(bus: SharedBus, clock: Arc<dyn SyncClock>) -> Self {
        let iso = Arc::new(IsoHandlerManager::new(bus.clone(), clock.clone()));
        Self {
            bus,
            clock,
            iso,
            activity: Arc::new(ActivitySignal::new()),
            cfg: Mutex::new(ManagerConfig::default()),
            receive: Mutex::new(Vec::new()),
            transmit: Mutex::new(Vec::new()),
            sync_source: Mutex::new(None),
            time_of_transfer: AtomicU64::new(0),
            shutdown_needed: AtomicBool::new(false),
            nb_periods: AtomicU64::new(0),
            delayed_usecs: AtomicI64::new(0),
            activity_timeout_usecs: AtomicU64::new(ACTIVITY_TIMEOUT_USECS),
            wait_lock: Mutex::new(()),
        }
    }

    /// The activity signal streams must be constructed with.
    pub fn activity(&self) -> Arc<ActivitySignal> {
        self.activity.clone()
    }

    /// The clock capability streams must be constructed with.
    pub fn clock(&self) -> Arc<dyn SyncClock> {
        self.clock.clone()
    }

    pub fn iso_manager(&self) -> Arc<IsoHandlerManager> {
        self.iso.clone()
    }

    // --- configuration ---

    pub fn set_period_size(&self, frames: usize) {
        self.cfg.lock().period_size = frames;
    }

    pub fn period_size(&self) -> usize {
        self.cfg.lock().period_size
    }

    pub fn set_nb_buffers(&self, n: usize) {
        self.cfg.lock().nb_buffers = n;
    }

    pub fn nb_buffers(&self) -> usize {
        self.cfg.lock().nb_buffers
    }

    pub fn set_nominal_rate(&self, rate: u32) {
        self.cfg.lock().nominal_rate = rate;
    }

    pub fn nominal_rate(&self) -> u32 {
        self.cfg.lock().nominal_rate
    }

    pub fn set_audio_data_type(&self, t: AudioDataType) {
        self.cfg.lock().audio_type = t;
    }

    pub fn audio_data_type(&self) -> AudioDataType {
        self.cfg.lock().audio_type
    }

    pub fn set_activity_wait_timeout_usecs(&self, usecs: u64) {
        self.activity_timeout_usecs.store(usecs, Ordering::Release);
    }

    // --- stream registration ---

    pub fn register_stream(&self, stream: Arc<StreamProcessor>) -> Result<()> {
        match stream.direction() {
            Direction::Receive => {
                let mut sync = self.sync_source.lock();
                if sync.is_none() {
                    *sync = Some(stream.clone());
                }
                self.receive.lock().push(stream);
            }
            Direction::Transmit => self.transmit.lock().push(stream),
        }
        Ok(())
    }

    pub fn unregister_stream(&self, stream: &Arc<StreamProcessor>) -> Result<()> {
        {
            let mut sync = self.sync_source.lock();
            if sync.as_ref().map(|s| Arc::ptr_eq(s, stream)).unwrap_or(false) {
                *sync = None;
            }
        }
        let list = match stream.direction() {
            Direction::Receive => &self.receive,
            Direction::Transmit => &self.transmit,
        };
        let mut list = list.lock();
        let idx = list
            .iter()
            .position(|s| Arc::ptr_eq(s, stream))
            .ok_or(StreamError::InvalidState("stream not registered"))?;
        list.remove(idx);
        drop(list);
        if self.iso.handler_for_stream(stream).is_some() {
            self.iso.unregister_stream(stream)?;
        }
        Ok(())
    }

    /// Designates the stream whose period boundaries drive the scheduler.
    pub fn set_sync_source(&self, stream: Arc<StreamProcessor>) {
        *self.sync_source.lock() = Some(stream);
    }

    pub fn sync_source(&self) -> Option<Arc<StreamProcessor>> {
        self.sync_source.lock().clone()
    }

    fn all_streams(&self) -> Vec<Arc<StreamProcessor>> {
        let mut all = self.receive.lock().clone();
        all.extend(self.transmit.lock().iter().cloned());
        all
    }

    // --- port surface ---

    pub fn get_port_count(&self, direction: PortDirection) -> usize {
        self.all_streams()
            .iter()
            .flat_map(|sp| sp.ports())
            .filter(|p| p.direction() == direction)
            .count()
    }

    pub fn get_port_by_index(&self, idx: usize, direction: PortDirection) -> Option<Arc<Port>> {
        self.all_streams()
            .iter()
            .flat_map(|sp| sp.ports())
            .filter(|p| p.direction() == direction)
            .nth(idx)
    }

    // --- status ---

    pub fn xrun_occurred(&self) -> bool {
        self.all_streams().iter().any(|sp| sp.xrun_occurred())
    }

    pub fn shutdown_needed(&self) -> bool {
        self.shutdown_needed.load(Ordering::Acquire)
    }

    pub fn nb_periods(&self) -> u64 {
        self.nb_periods.load(Ordering::Relaxed)
    }

    /// How late the last period wake-up was, in microseconds.
    pub fn delayed_usecs(&self) -> i64 {
        self.delayed_usecs.load(Ordering::Relaxed)
    }

    pub fn time_of_transfer(&self) -> u64 {
        self.time_of_transfer.load(Ordering::Acquire)
    }

    /// Microseconds until the sync source signals the next period.
    pub fn get_time_until_next_period_usecs(&self) -> i64 {
        self.sync_source()
            .map(|s| s.time_until_next_period_signal_usecs())
            .unwrap_or(0)
    }

    // --- lifecycle ---

    fn stream_config(&self) -> StreamConfig {
        let cfg = self.cfg.lock();
        StreamConfig {
            period_size: cfg.period_size,
            nb_buffers: cfg.nb_buffers,
            nominal_rate: cfg.nominal_rate,
            audio_type: cfg.audio_type,
            local_node_id: self.bus.local_node_id(),
        }
    }

    /// Applies the configuration to every stream and allocates their iso
    /// contexts.
    pub fn prepare(&self) -> Result<()> {
        let cfg = self.stream_config();
        for sp in self.all_streams() {
            sp.prepare(cfg.clone())?;
            if self.iso.handler_for_stream(&sp).is_none() {
                self.iso.register_stream(&sp)?;
            }
        }
        Ok(())
    }

    /// Starts all streams synchronously; retried as a whole on failure.
    pub fn start(&self) -> Result<()> {
        self.shutdown_needed.store(false, Ordering::Release);
        let mut last_err = None;
        for ntry in 0..SYNCSTART_TRIES {
            match self
                .start_dry_running()
                .and_then(|_| self.sync_start_all())
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("sync start try {} failed: {}", ntry, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(StreamError::Timeout("sync start")))
    }

    pub fn stop(&self) -> Result<()> {
        log::debug!("stopping all streams");
        let all = self.all_streams();
        for sp in &all {
            if sp.is_running() {
                sp.schedule_stop_running(-1)?;
            }
        }
        for sp in &all {
            match sp.state() {
                ProcessorState::DryRunning | ProcessorState::Stopped => {}
                _ => sp.wait_for_state(ProcessorState::DryRunning, 2000)?,
            }
        }
        for sp in &all {
            if sp.state() == ProcessorState::DryRunning {
                sp.schedule_stop_dry_running(-1)?;
            }
        }
        for sp in &all {
            if sp.state() != ProcessorState::Stopped {
                sp.wait_for_state(ProcessorState::Stopped, 2000)?;
            }
        }
        self.iso.stop_handlers()
    }

    /// Brings every stream into `DryRunning`, enabling its handler a little
    /// ahead of the scheduled switch.
    fn start_dry_running(&self) -> Result<()> {
        for sp in self.all_streams() {
            match sp.state() {
                ProcessorState::Stopped => {
                    let tx = add_ticks(
                        self.clock.now_ticks(),
                        DRY_START_CYCLES as u64 * TICKS_PER_CYCLE as u64,
                    );
                    let handler_cycle = ticks_to_cycles(sub_ticks(
                        tx,
                        DRY_START_HANDLER_LEAD_CYCLES as u64 * TICKS_PER_CYCLE as u64,
                    ));
                    self.iso
                        .start_handler_for_stream(&sp, handler_cycle as i32)?;
                    sp.schedule_state_transition(ProcessorState::WaitingForStream, tx);
                }
                ProcessorState::Running => sp.schedule_stop_running(-1)?,
                ProcessorState::DryRunning | ProcessorState::WaitingForStreamDisable => {}
                _ => {
                    return Err(StreamError::InvalidState(
                        "stream cannot reach dry-running from here",
                    ))
                }
            }
        }
        // roughly a second of bus cycles for every stream to get there
        for sp in self.all_streams() {
            sp.wait_for_state(ProcessorState::DryRunning, 1000)?;
        }
        log::debug!("all streams dry-running");
        Ok(())
    }

    /// Starts wet-running on every stream against a common start time read
    /// from the sync source, then phase aligns the receive streams.
    fn sync_start_all(&self) -> Result<()> {
        let sync = self
            .sync_source()
            .ok_or(StreamError::InvalidState("no sync source"))?;
        let (period, nb_buffers, rate) = {
            let cfg = self.cfg.lock();
            (cfg.period_size, cfg.nb_buffers, cfg.nominal_rate)
        };

        // how long after reception the last frame of a period becomes
        // visible to us, plus margin; the period signal is delayed by it
        let mut max_latency_ticks = 0u64;
        for sp in self.receive.lock().iter() {
            let ticks =
                self.iso.packet_latency_for_stream(sp) as u64 * TICKS_PER_CYCLE as u64;
            max_latency_ticks = max_latency_ticks.max(ticks);
        }
        let sync_delay = max_latency_ticks + SIGNAL_DELAY_TICKS;
        log::debug!("sync delay: {} ticks", sync_delay);
        sync.set_sync_delay(sync_delay);

        // dry-run long enough for the rate DLLs to settle
        let mut nb_sync_runs =
            (SYNC_WAIT_TIME_MSEC as usize * rate as usize / 1000 / period).max(1);
        while nb_sync_runs > 0 {
            let usecs = sync.time_until_next_period_signal_usecs();
            if usecs > 0 {
                std::thread::sleep(Duration::from_micros(usecs as u64));
            }
            nb_sync_runs -= 1;
        }

        let time_of_first_sample = add_ticks(
            sync.time_at_period(),
            CYCLES_FOR_STARTUP as u64 * TICKS_PER_CYCLE as u64,
        );
        let time_to_start_xmit = sub_ticks(
            time_of_first_sample,
            PRESTART_CYCLES_FOR_XMIT as u64 * TICKS_PER_CYCLE as u64,
        );
        let time_to_start_recv = sub_ticks(
            time_of_first_sample,
            PRESTART_CYCLES_FOR_RECV as u64 * TICKS_PER_CYCLE as u64,
        );
        log::debug!(
            "first sample at {}, xmit starts {}, recv starts {}",
            time_of_first_sample,
            time_to_start_xmit,
            time_to_start_recv
        );

        // the presentation time of the first transmitted sample
        for sp in self.transmit.lock().iter() {
            sp.set_buffer_head_timestamp(time_of_first_sample);
        }

        let time_to_start_sync = match sync.direction() {
            Direction::Receive => time_to_start_recv,
            Direction::Transmit => time_to_start_xmit,
        };
        sync.schedule_start_running(time_to_start_sync as i64)?;
        for sp in self.receive.lock().iter() {
            if !Arc::ptr_eq(sp, &sync) {
                sp.schedule_start_running(time_to_start_recv as i64)?;
            }
        }
        for sp in self.transmit.lock().iter() {
            if !Arc::ptr_eq(sp, &sync) {
                sp.schedule_start_running(time_to_start_xmit as i64)?;
            }
        }

        // everything hangs off the sync source actually starting
        let timeout_ms = (CYCLES_FOR_STARTUP as u64 * 125 / 1000) * 20;
        sync.wait_for_state(ProcessorState::Running, timeout_ms.max(1000))?;

        self.time_of_transfer
            .store(sync.time_at_period(), Ordering::Release);

        // one period has been received by transfer time, so the transmit
        // ring conceptually holds nb_buffers - 1 periods; its tail follows
        let tpf = sync.ticks_per_frame();
        let delay_ticks = (((nb_buffers - 1) * period) as f64 * tpf) as u64;
        let transmit_tail = add_ticks(self.time_of_transfer(), delay_ticks);
        for sp in self.transmit.lock().iter() {
            sp.set_buffer_tail_timestamp(transmit_tail);
            sp.set_ticks_per_frame(tpf);
        }

        self.align_received_streams()?;
        log::debug!("all streams running");
        Ok(())
    }

    /// Repeatedly measures the tick offset of every receive stream against
    /// the sync source, averaged over some periods, and shifts the streams
    /// until every offset is below one frame.
    fn align_received_streams(&self) -> Result<()> {
        let sync = self
            .sync_source()
            .ok_or(StreamError::InvalidState("no sync source"))?;
        let (period, rate) = {
            let cfg = self.cfg.lock();
            (cfg.period_size, cfg.nominal_rate)
        };
        let receive = self.receive.lock().clone();
        if receive.is_empty() {
            return Ok(());
        }
        let periods_per_try =
            (ALIGN_AVERAGE_TIME_MSEC as usize * rate as usize / 1000 / period).max(1) as i64;

        for round in 0..NB_ALIGN_TRIES {
            let mut diffs = vec![0i64; receive.len()];
            for _ in 0..periods_per_try {
                self.wait_for_period()?;
                self.transfer_silence()?;
                for (i, sp) in receive.iter().enumerate() {
                    diffs[i] += diff_ticks(sync.time_at_period(), sp.time_at_period());
                }
            }

            let mut aligned = true;
            for (i, sp) in receive.iter().enumerate() {
                let avg = diffs[i] / periods_per_try;
                let frames = (avg as f64 / sp.ticks_per_frame()).round() as i64;
                log::debug!(
                    "align round {}: stream {} offset {} ticks = {} frames",
                    round,
                    i,
                    avg,
                    frames
                );
                aligned &= frames == 0;
                sp.shift_stream(frames)?;
            }
            if aligned {
                return Ok(());
            }
        }
        Err(StreamError::XRun("receive streams would not align"))
    }

    /// Called after `wait_for_period` reported an xrun: resynchronizes the
    /// whole stream set.
    pub fn handle_xrun(&self) -> Result<()> {
        log::warn!("handling xrun");
        let mut last_err = None;
        for ntry in 0..SYNCSTART_TRIES {
            if self.shutdown_needed() {
                return Ok(());
            }
            match self
                .start_dry_running()
                .and_then(|_| self.sync_start_all())
            {
                Ok(()) => {
                    log::debug!("xrun handled");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("xrun recovery try {} failed: {}", ntry, e);
                    last_err = Some(e);
                }
            }
        }
        self.shutdown_needed.store(true, Ordering::Release);
        Err(last_err.unwrap_or(StreamError::ShutdownNeeded))
    }

    // --- the period loop ---

    /// Blocks until one full period is ready on every stream. Returns
    /// `XRun` when a stream overran, `Timeout` when nothing happened within
    /// the activity timeout, `ShutdownNeeded` after a bus reset.
    pub fn wait_for_period(&self) -> Result<()> {
        let sync = self
            .sync_source()
            .ok_or(StreamError::InvalidState("no sync source"))?;
        if self.shutdown_needed() {
            return Err(StreamError::ShutdownNeeded);
        }
        let _guard = self.wait_lock.lock();
        let timeout = Duration::from_micros(self.activity_timeout_usecs.load(Ordering::Acquire));

        let mut xrun = false;
        loop {
            if self.activity.wait(timeout) == ActivityResult::Timeout {
                log::warn!("timeout while waiting for period");
                return Err(StreamError::Timeout("period activity"));
            }
            if self.shutdown_needed() {
                return Err(StreamError::ShutdownNeeded);
            }

            let mut ready = true;
            for sp in self.receive.lock().iter() {
                ready &= sp.can_consume_period();
                xrun |= sp.xrun_occurred();
            }
            for sp in self.transmit.lock().iter() {
                ready &= sp.can_produce_period();
                xrun |= sp.xrun_occurred();
            }
            if xrun || ready {
                break;
            }
        }

        // the 'ideal' transfer time is fixed here; both directions use it
        // even when the client interleaves reads and writes
        self.time_of_transfer
            .store(sync.time_at_period(), Ordering::Release);
        self.delayed_usecs.store(
            -sync.time_until_next_period_signal_usecs(),
            Ordering::Relaxed,
        );
        self.nb_periods.fetch_add(1, Ordering::Relaxed);

        if xrun {
            log::warn!("period wait ended in xrun");
            Err(StreamError::XRun("stream xrun"))
        } else {
            Ok(())
        }
    }

    /// Moves one period out of every receive stream and into every
    /// transmit stream.
    pub fn transfer(&self) -> Result<()> {
        self.transfer_direction(Direction::Receive)?;
        self.transfer_direction(Direction::Transmit)
    }

    pub fn transfer_direction(&self, direction: Direction) -> Result<()> {
        let period = self.period_size();
        let tof = self.time_of_transfer();
        match direction {
            Direction::Receive => {
                for sp in self.receive.lock().iter() {
                    sp.get_frames(period, tof)?;
                }
            }
            Direction::Transmit => {
                let sync = self
                    .sync_source()
                    .ok_or(StreamError::InvalidState("no sync source"))?;
                let nb_buffers = self.nb_buffers();
                // written data goes on the wire one ring length later
                let ring_ticks =
                    ((nb_buffers * period) as f64 * sync.ticks_per_frame()) as u64;
                let ts = add_ticks(tof, ring_ticks);
                for sp in self.transmit.lock().iter() {
                    sp.put_frames(period, ts)?;
                }
            }
        }
        Ok(())
    }

    /// Drops one receive period and queues one transmit period of silence.
    /// Transmit goes first: silence is always available, and priming the
    /// output before touching the input helps startup.
    pub fn transfer_silence(&self) -> Result<()> {
        self.transfer_silence_direction(Direction::Transmit)?;
        self.transfer_silence_direction(Direction::Receive)
    }

    pub fn transfer_silence_direction(&self, direction: Direction) -> Result<()> {
        let period = self.period_size();
        let tof = self.time_of_transfer();
        match direction {
            Direction::Receive => {
                for sp in self.receive.lock().iter() {
                    sp.drop_frames(period)?;
                }
            }
            Direction::Transmit => {
                let sync = self
                    .sync_source()
                    .ok_or(StreamError::InvalidState("no sync source"))?;
                let nb_buffers = self.nb_buffers();
                let ring_ticks =
                    ((nb_buffers * period) as f64 * sync.ticks_per_frame()) as u64;
                let ts = add_ticks(tof, ring_ticks);
                for sp in self.transmit.lock().iter() {
                    sp.put_silence_frames(period, ts)?;
                }
            }
        }
        Ok(())
    }

    // --- bus reset ---

    /// To be wired into the bus service's reset notification. Drops every
    /// stream to `Stopped` and releases the client with a shutdown
    /// indication; recovery is the caller's responsibility.
    pub fn handle_bus_reset(&self, generation: u32) {
        log::warn!("bus reset (generation {})", generation);
        // release a client blocked in wait_for_period before taking the
        // wait lock ourselves
        self.shutdown_needed.store(true, Ordering::Release);
        self.activity.signal();
        let _guard = self.wait_lock.lock();
        for sp in self.all_streams() {
            sp.handle_bus_reset();
        }
        self.activity.signal();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::amdtp::{AmdtpReceive, AmdtpTransmit};
    use crate::ports::PortDirection;
    use crate::testing::{MockBus, MockClock};

    const DIM: usize = 2;

    struct Fixture {
        spm: StreamProcessorManager,
        rx: Arc<StreamProcessor>,
        tx: Arc<StreamProcessor>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MockClock::new(0));
        let bus = Arc::new(MockBus::new(clock.clone()));
        let spm = StreamProcessorManager::new(bus, clock.clone());
        spm.set_period_size(16);
        spm.set_nb_buffers(3);
        spm.set_nominal_rate(48_000);

        let rx = StreamProcessor::new(
            Direction::Receive,
            Box::new(AmdtpReceive::new(DIM)),
            spm.clock(),
            spm.activity(),
        );
        for i in 0..DIM as u32 {
            rx.add_port(Arc::new(Port::new_audio(
                format!("cap_{}", i),
                PortDirection::Capture,
                i,
            )))
            .unwrap();
        }
        rx.set_channel(0);
        let rx = Arc::new(rx);

        let tx = StreamProcessor::new(
            Direction::Transmit,
            Box::new(AmdtpTransmit::new(DIM)),
            spm.clock(),
            spm.activity(),
        );
        for i in 0..DIM as u32 {
            tx.add_port(Arc::new(Port::new_audio(
                format!("pb_{}", i),
                PortDirection::Playback,
                i,
            )))
            .unwrap();
        }
        tx.set_channel(1);
        let tx = Arc::new(tx);

        spm.register_stream(rx.clone()).unwrap();
        spm.register_stream(tx.clone()).unwrap();
        Fixture { spm, rx, tx }
    }

    #[test]
    fn test_defaults_and_setters() {
        let clock = Arc::new(MockClock::new(0));
        let bus = Arc::new(MockBus::new(clock.clone()));
        let spm = StreamProcessorManager::new(bus, clock);
        assert_eq!(spm.period_size(), 1024);
        assert_eq!(spm.nb_buffers(), 3);
        assert_eq!(spm.nominal_rate(), 48_000);
        spm.set_period_size(256);
        spm.set_nominal_rate(96_000);
        spm.set_audio_data_type(AudioDataType::Float);
        assert_eq!(spm.period_size(), 256);
        assert_eq!(spm.nominal_rate(), 96_000);
        assert_eq!(spm.audio_data_type(), AudioDataType::Float);
    }

    #[test]
    fn test_first_receive_stream_is_sync_source() {
        let f = fixture();
        let sync = f.spm.sync_source().unwrap();
        assert!(Arc::ptr_eq(&sync, &f.rx));
        // explicit override
        f.spm.set_sync_source(f.tx.clone());
        assert!(Arc::ptr_eq(&f.spm.sync_source().unwrap(), &f.tx));
    }

    #[test]
    fn test_prepare_configures_streams_and_contexts() {
        let f = fixture();
        f.spm.prepare().unwrap();
        assert_eq!(f.rx.state(), ProcessorState::Stopped);
        assert_eq!(f.tx.state(), ProcessorState::Stopped);
        assert!(f.spm.iso_manager().handler_for_stream(&f.rx).is_some());
        assert!(f.spm.iso_manager().handler_for_stream(&f.tx).is_some());
        // port buffers sized to the period
        assert_eq!(f.rx.ports()[0].buffer_size(), 16);
    }

    #[test]
    fn test_port_surface() {
        let f = fixture();
        assert_eq!(f.spm.get_port_count(PortDirection::Capture), DIM);
        assert_eq!(f.spm.get_port_count(PortDirection::Playback), DIM);
        let p = f.spm.get_port_by_index(1, PortDirection::Capture).unwrap();
        assert_eq!(p.name(), "cap_1");
        assert!(f
            .spm
            .get_port_by_index(5, PortDirection::Capture)
            .is_none());
    }

    #[test]
    fn test_wait_for_period_times_out() {
        let f = fixture();
        f.spm.prepare().unwrap();
        f.spm.set_activity_wait_timeout_usecs(10_000);
        // no packets flow and nobody posts activity
        match f.spm.wait_for_period() {
            Err(StreamError::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_wait_for_period_with_dry_streams() {
        let f = fixture();
        f.spm.prepare().unwrap();
        // dry streams are always ready; one posted activity releases us
        f.spm.activity().signal();
        f.spm.wait_for_period().unwrap();
        assert_eq!(f.spm.nb_periods(), 1);
    }

    #[test]
    fn test_transfer_with_dry_streams() {
        let f = fixture();
        f.spm.prepare().unwrap();
        f.spm.transfer().unwrap();
        f.spm.transfer_silence().unwrap();
    }

    #[test]
    fn test_bus_reset_stops_streams_and_signals_shutdown() {
        let f = fixture();
        f.spm.prepare().unwrap();
        f.spm.handle_bus_reset(42);
        assert!(f.spm.shutdown_needed());
        assert_eq!(f.rx.state(), ProcessorState::Stopped);
        assert_eq!(f.tx.state(), ProcessorState::Stopped);
        match f.spm.wait_for_period() {
            Err(StreamError::ShutdownNeeded) => {}
            other => panic!("expected shutdown, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unregister_stream() {
        let f = fixture();
        f.spm.prepare().unwrap();
        f.spm.unregister_stream(&f.rx).unwrap();
        assert!(f.spm.sync_source().is_none());
        assert_eq!(f.spm.get_port_count(PortDirection::Capture), 0);
        assert!(f.spm.iso_manager().handler_for_stream(&f.rx).is_none());
    }
}
