//! Shared test doubles.

use std::sync::atomic::{AtomicU64, Ordering};

use firestream_clock::{sub_ticks, SyncClock, TICKS_PER_USEC};

/// A clock whose bus time is set by the test.
pub struct MockClock {
    ticks: AtomicU64,
}

impl MockClock {
    pub fn new(ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
        }
    }

    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl SyncClock for MockClock {
    fn now_usecs(&self) -> u64 {
        (self.ticks.load(Ordering::SeqCst) as f64 / TICKS_PER_USEC) as u64
    }

    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn ticks_at(&self, usecs: u64) -> u64 {
        let now_usecs = self.now_usecs();
        let now = self.now_ticks();
        if usecs >= now_usecs {
            firestream_clock::add_ticks(now, ((usecs - now_usecs) as f64 * TICKS_PER_USEC) as u64)
        } else {
            sub_ticks(now, ((now_usecs - usecs) as f64 * TICKS_PER_USEC) as u64)
        }
    }

    fn rate(&self) -> f64 {
        TICKS_PER_USEC
    }
}

#[cfg(unix)]
pub use mock_bus::{MockBus, MockRxPacket};

#[cfg(unix)]
mod mock_bus {
    use super::MockClock;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use firestream_clock::{ticks_to_ctr, CycleTimerSource, SyncClock};

    use crate::bus::{
        BusResetHandler, BusService, IsoContextId, IsoContextParams, IsoDirection,
        IsoDisposition, IsoPacketClient,
    };
    use crate::error::{Result, StreamError};

    pub struct MockRxPacket {
        pub data: Vec<u8>,
        pub channel: u8,
        pub tag: u8,
        pub sy: u8,
        pub cycle: u32,
    }

    struct MockCtx {
        params: IsoContextParams,
        fd_read: i32,
        fd_write: i32,
    }

    /// Scripted in-process bus: receive contexts deliver queued packets,
    /// transmit contexts request packets for queued cycles. Each context
    /// gets a pipe with a pending byte so its descriptor always polls
    /// readable.
    pub struct MockBus {
        pub clock: Arc<MockClock>,
        next_id: AtomicU64,
        contexts: Mutex<HashMap<u64, MockCtx>>,
        pub started: Mutex<Vec<(u64, i32)>>,
        pub stopped: Mutex<Vec<u64>>,
        pub rx_packets: Mutex<VecDeque<MockRxPacket>>,
        pub tx_requests: Mutex<VecDeque<i32>>,
        pub tx_log: Mutex<Vec<(i32, usize)>>,
    }

    impl MockBus {
        pub fn new(clock: Arc<MockClock>) -> Self {
            Self {
                clock,
                next_id: AtomicU64::new(1),
                contexts: Mutex::new(HashMap::new()),
                started: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
                rx_packets: Mutex::new(VecDeque::new()),
                tx_requests: Mutex::new(VecDeque::new()),
                tx_log: Mutex::new(Vec::new()),
            }
        }

        pub fn queue_rx(&self, pkt: MockRxPacket) {
            self.rx_packets.lock().push_back(pkt);
        }

        pub fn queue_tx_cycle(&self, cycle: i32) {
            self.tx_requests.lock().push_back(cycle);
        }
    }

    impl Drop for MockBus {
        fn drop(&mut self) {
            for ctx in self.contexts.lock().values() {
                unsafe {
                    libc::close(ctx.fd_read);
                    libc::close(ctx.fd_write);
                }
            }
        }
    }

    impl CycleTimerSource for MockBus {
        fn read_cycle_timer(&self) -> std::result::Result<(u32, u64), firestream_clock::ClockError>
        {
            Ok((ticks_to_ctr(self.clock.now_ticks()), self.clock.now_usecs()))
        }
    }

    impl BusService for MockBus {
        fn create_iso_context(&self, params: &IsoContextParams) -> Result<IsoContextId> {
            let mut fds = [0i32; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc != 0 {
                return Err(StreamError::Resource("pipe failed".into()));
            }
            // one pending byte keeps the read end permanently readable
            let byte = [1u8];
            unsafe { libc::write(fds[1], byte.as_ptr() as *const libc::c_void, 1) };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().insert(
                id,
                MockCtx {
                    params: params.clone(),
                    fd_read: fds[0],
                    fd_write: fds[1],
                },
            );
            Ok(IsoContextId(id))
        }

        fn start_iso(&self, ctx: IsoContextId, start_cycle: i32, _sync: u32, _tags: u32)
            -> Result<()> {
            self.started.lock().push((ctx.0, start_cycle));
            Ok(())
        }

        fn stop_iso(&self, ctx: IsoContextId) -> Result<()> {
            self.stopped.lock().push(ctx.0);
            Ok(())
        }

        fn destroy_iso(&self, ctx: IsoContextId) -> Result<()> {
            if let Some(c) = self.contexts.lock().remove(&ctx.0) {
                unsafe {
                    libc::close(c.fd_read);
                    libc::close(c.fd_write);
                }
            }
            Ok(())
        }

        fn poll_fd(&self, ctx: IsoContextId) -> Result<i32> {
            self.contexts
                .lock()
                .get(&ctx.0)
                .map(|c| c.fd_read)
                .ok_or(StreamError::Bus("unknown context".into()))
        }

        fn loop_iterate(
            &self,
            ctx: IsoContextId,
            client: &mut dyn IsoPacketClient,
        ) -> Result<()> {
            let direction = self
                .contexts
                .lock()
                .get(&ctx.0)
                .map(|c| c.params.direction)
                .ok_or(StreamError::Bus("unknown context".into()))?;
            match direction {
                IsoDirection::Receive => {
                    while let Some(pkt) = self.rx_packets.lock().pop_front() {
                        let ret = client.put_packet(
                            &pkt.data,
                            pkt.channel,
                            pkt.tag,
                            pkt.sy,
                            pkt.cycle,
                            0,
                            0,
                        );
                        if ret == IsoDisposition::Defer || ret == IsoDisposition::Error {
                            break;
                        }
                    }
                }
                IsoDirection::Transmit => {
                    while let Some(cycle) = self.tx_requests.lock().pop_front() {
                        let mut data = vec![0u8; 4096];
                        let mut length = 0;
                        let mut tag = 0;
                        let mut sy = 0;
                        let ret = client
                            .get_packet(&mut data, &mut length, &mut tag, &mut sy, cycle, 0, 0);
                        self.tx_log.lock().push((cycle, length));
                        if ret == IsoDisposition::Defer || ret == IsoDisposition::Error {
                            break;
                        }
                    }
                }
            }
            Ok(())
        }

        fn flush_iso(&self, _ctx: IsoContextId) -> Result<()> {
            Ok(())
        }

        fn register_bus_reset_handler(&self, _handler: BusResetHandler) {}

        fn local_node_id(&self) -> u8 {
            1
        }
    }
}
