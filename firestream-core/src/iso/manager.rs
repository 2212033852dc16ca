//! Handler aggregation and the packet pump.
//!
//! All contexts are serviced by one task thread: it keeps a shadow copy of
//! the handler table (rebuilt only when a registration or state change
//! requests it, so registration never blocks the pump), gates each context's
//! `POLLIN` on whether its stream can actually produce or consume a packet,
//! and blocks on the sync handler's client when nobody is ready instead of
//! busy-looping.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use firestream_clock::{sys, SyncClock};

use crate::bus::{IsoDirection, IsoSpeed, SharedBus};
use crate::error::{Result, StreamError};
use crate::iso::handler::IsoHandler;
use crate::stream::processor::{Direction, StreamProcessor};
use crate::RtWatchdog;

/// Upper bound on simultaneously polled handlers.
pub const MAX_ISO_HANDLERS: usize = 16;

const POLL_TIMEOUT_MS: u64 = 10;
const MAX_SHORT_LOOPS: u32 = 100;
/// Extra transmit packets buffered beyond the ring coverage.
const XMIT_EXTRA_PACKETS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IsoManagerState {
    Created = 0,
    Running = 1,
    Error = 2,
}

/// Owns the iso handlers and the pump thread.
pub struct IsoHandlerManager {
    bus: SharedBus,
    clock: Arc<dyn SyncClock>,
    state: Arc<AtomicU8>,
    handlers: Arc<Mutex<Vec<Arc<IsoHandler>>>>,
    request_update: Arc<AtomicI32>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    realtime_priority: Option<i32>,
    watchdog: Option<Arc<dyn RtWatchdog>>,
}

impl IsoHandlerManager {
    pub fn new(bus: SharedBus, clock: Arc<dyn SyncClock>) -> Self {
        Self::with_options(bus, clock, None, None)
    }

    pub fn with_options(
        bus: SharedBus,
        clock: Arc<dyn SyncClock>,
        realtime_priority: Option<i32>,
        watchdog: Option<Arc<dyn RtWatchdog>>,
    ) -> Self {
        Self {
            bus,
            clock,
            state: Arc::new(AtomicU8::new(IsoManagerState::Created as u8)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            request_update: Arc::new(AtomicI32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            realtime_priority,
            watchdog,
        }
    }

    pub fn state(&self) -> IsoManagerState {
        match self.state.load(Ordering::Acquire) {
            0 => IsoManagerState::Created,
            1 => IsoManagerState::Running,
            _ => IsoManagerState::Error,
        }
    }

    /// Asks the pump to rebuild its shadow table at the next loop entry.
    pub fn request_shadow_update(&self) {
        self.request_update.fetch_add(1, Ordering::SeqCst);
    }

    /// Allocates a handler for a (prepared) stream. Context sizing derives
    /// from the stream's packet geometry.
    pub fn register_stream(&self, stream: &Arc<StreamProcessor>) -> Result<()> {
        let cfg = stream
            .config()
            .ok_or(StreamError::InvalidState("stream must be prepared first"))?;
        let packets_per_period = stream.packets_per_period()?.max(1) as u32;
        let max_packet_size = stream.max_packet_size() as u32;

        let direction = match stream.direction() {
            Direction::Receive => IsoDirection::Receive,
            Direction::Transmit => IsoDirection::Transmit,
        };
        let (buf_packets, irq_interval) = match direction {
            IsoDirection::Receive => {
                let bp = (packets_per_period * 4).clamp(16, 1024);
                (bp, (bp / 4).clamp(1, 32))
            }
            IsoDirection::Transmit => {
                let bp = packets_per_period * cfg.nb_buffers as u32 + XMIT_EXTRA_PACKETS;
                (bp, (bp / 4).clamp(1, 32))
            }
        };

        let mut handlers = self.handlers.lock();
        if handlers.len() >= MAX_ISO_HANDLERS {
            return Err(StreamError::Resource("too many iso handlers".into()));
        }
        let handler = Arc::new(IsoHandler::new(
            direction,
            self.bus.clone(),
            buf_packets,
            max_packet_size,
            irq_interval,
            IsoSpeed::S400,
        ));
        handler.register_stream(stream.clone())?;
        handler.init()?;
        log::debug!(
            "registered {:?} stream: {} packets, irq {}, maxpkt {}",
            direction,
            buf_packets,
            irq_interval,
            max_packet_size
        );
        handlers.push(handler);
        drop(handlers);
        self.request_shadow_update();
        Ok(())
    }

    pub fn unregister_stream(&self, stream: &Arc<StreamProcessor>) -> Result<()> {
        let mut handlers = self.handlers.lock();
        let idx = handlers
            .iter()
            .position(|h| h.serves_stream(stream))
            .ok_or(StreamError::InvalidState("stream not registered"))?;
        let handler = handlers.remove(idx);
        drop(handlers);
        handler.unregister_stream(stream)?;
        handler.destroy()?;
        self.request_shadow_update();
        Ok(())
    }

    pub fn handler_for_stream(&self, stream: &Arc<StreamProcessor>) -> Option<Arc<IsoHandler>> {
        self.handlers
            .lock()
            .iter()
            .find(|h| h.serves_stream(stream))
            .cloned()
    }

    /// Wake-up latency for a stream's context, in cycles.
    pub fn packet_latency_for_stream(&self, stream: &Arc<StreamProcessor>) -> u32 {
        self.handler_for_stream(stream)
            .map(|h| h.packet_latency())
            .unwrap_or(0)
    }

    pub fn flush_stream(&self, stream: &Arc<StreamProcessor>) {
        if let Some(handler) = self.handler_for_stream(stream) {
            handler.flush();
        }
    }

    /// Prepares and enables the context serving `stream`, starting at
    /// `cycle` (-1 = now).
    pub fn start_handler_for_stream(
        &self,
        stream: &Arc<StreamProcessor>,
        cycle: i32,
    ) -> Result<()> {
        let handler = self
            .handler_for_stream(stream)
            .ok_or(StreamError::InvalidState("stream not registered"))?;
        handler.prepare()?;
        handler.enable(cycle)?;
        self.request_shadow_update();
        self.ensure_task_running()?;
        Ok(())
    }

    pub fn stop_handler_for_stream(&self, stream: &Arc<StreamProcessor>) -> Result<()> {
        let handler = self
            .handler_for_stream(stream)
            .ok_or(StreamError::InvalidState("stream not registered"))?;
        handler.disable()?;
        self.request_shadow_update();
        Ok(())
    }

    /// Enables every registered handler at the same future cycle so all
    /// streams start in phase.
    pub fn start_handlers(&self, cycle: i32) -> Result<()> {
        let handlers: Vec<_> = self.handlers.lock().clone();
        for handler in &handlers {
            handler.prepare()?;
            handler.enable(cycle)?;
        }
        self.state
            .store(IsoManagerState::Running as u8, Ordering::Release);
        self.request_shadow_update();
        self.ensure_task_running()?;
        Ok(())
    }

    /// Disables all handlers, last registered first.
    pub fn stop_handlers(&self) -> Result<()> {
        let handlers: Vec<_> = self.handlers.lock().clone();
        for handler in handlers.iter().rev() {
            if handler.is_enabled() {
                handler.disable()?;
            }
        }
        self.request_shadow_update();
        Ok(())
    }

    /// Releases handlers whose client went away.
    pub fn prune_handlers(&self) {
        let mut handlers = self.handlers.lock();
        handlers.retain(|h| {
            if h.in_use() {
                true
            } else {
                if let Err(e) = h.destroy() {
                    log::warn!("could not destroy unused handler: {}", e);
                }
                false
            }
        });
        drop(handlers);
        self.request_shadow_update();
    }

    fn ensure_task_running(&self) -> Result<()> {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let mut task = IsoTask {
            clock: self.clock.clone(),
            handlers: self.handlers.clone(),
            request_update: self.request_update.clone(),
            running: self.running.clone(),
            manager_state: self.state.clone(),
            shadow: Vec::new(),
            #[cfg(unix)]
            shadow_fds: Vec::new(),
            sync_handler: None,
            last_loop_entry: 0,
            short_loops: 0,
        };
        let prio = self.realtime_priority;
        let watchdog = self.watchdog.clone();
        let handle = thread::Builder::new()
            .name("fw-iso-task".into())
            .spawn(move || {
                if let Some(prio) = prio {
                    sys::set_realtime_priority(prio);
                }
                if let Some(wd) = &watchdog {
                    wd.register_thread("fw-iso-task");
                }
                while task.running.load(Ordering::SeqCst) {
                    if !task.execute_once() {
                        log::error!("iso task exiting");
                        task.manager_state
                            .store(IsoManagerState::Error as u8, Ordering::Release);
                        break;
                    }
                }
                if let Some(wd) = &watchdog {
                    wd.unregister_thread("fw-iso-task");
                }
            })
            .map_err(|e| StreamError::Resource(format!("could not spawn iso task: {}", e)))?;
        *guard = Some(handle);
        Ok(())
    }

    pub fn stop_task(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IsoHandlerManager {
    fn drop(&mut self) {
        self.stop_task();
        let _ = self.stop_handlers();
    }
}

/// State owned by the pump thread.
pub(crate) struct IsoTask {
    pub(crate) clock: Arc<dyn SyncClock>,
    pub(crate) handlers: Arc<Mutex<Vec<Arc<IsoHandler>>>>,
    pub(crate) request_update: Arc<AtomicI32>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) manager_state: Arc<AtomicU8>,
    pub(crate) shadow: Vec<Arc<IsoHandler>>,
    #[cfg(unix)]
    pub(crate) shadow_fds: Vec<libc::pollfd>,
    pub(crate) sync_handler: Option<Arc<IsoHandler>>,
    pub(crate) last_loop_entry: u64,
    pub(crate) short_loops: u32,
}

impl IsoTask {
    /// Rebuilds the shadow table from the live handler list. The sync
    /// handler is the first enabled transmit handler, else the first
    /// enabled handler.
    pub(crate) fn update_shadow(&mut self) {
        let handlers = self.handlers.lock();
        self.shadow.clear();
        #[cfg(unix)]
        self.shadow_fds.clear();
        self.sync_handler = None;
        for handler in handlers.iter() {
            if !handler.is_enabled() {
                continue;
            }
            if self.shadow.len() >= MAX_ISO_HANDLERS {
                log::warn!("too many enabled iso handlers, ignoring the rest");
                break;
            }
            if self.sync_handler.is_none() && handler.direction() == IsoDirection::Transmit {
                self.sync_handler = Some(handler.clone());
            }
            #[cfg(unix)]
            self.shadow_fds.push(libc::pollfd {
                fd: handler.poll_descriptor(),
                events: 0,
                revents: 0,
            });
            self.shadow.push(handler.clone());
        }
        if self.sync_handler.is_none() {
            self.sync_handler = self.shadow.first().cloned();
        }
        log::debug!("shadow table rebuilt: {} handler(s)", self.shadow.len());
    }

    /// One pump iteration. Returns false to shut the task down.
    pub(crate) fn execute_once(&mut self) -> bool {
        // a healthy iteration either polls or sleeps; back-to-back entries
        // mean something is spinning
        let entry = sys::now_usecs();
        if entry.saturating_sub(self.last_loop_entry) < 100 {
            self.short_loops += 1;
            if self.short_loops > MAX_SHORT_LOOPS {
                log::error!("iso task: runaway loop, shutting down");
                return false;
            }
        } else {
            self.short_loops = 0;
        }
        self.last_loop_entry = entry;

        if self.request_update.load(Ordering::SeqCst) > 0 {
            self.update_shadow();
            self.request_update.fetch_sub(1, Ordering::SeqCst);
        }

        if self.shadow.is_empty() {
            sys::sleep_usecs(POLL_TIMEOUT_MS * 1000);
            return true;
        }

        // only poll descriptors whose client can actually move a packet;
        // polling an unready transmit context would busy-loop on Again
        let mut anyone_ready = false;
        for (i, handler) in self.shadow.iter().enumerate() {
            let ready = handler
                .client()
                .map(|c| c.packets_ready())
                .unwrap_or(false);
            #[cfg(unix)]
            {
                self.shadow_fds[i].events = if ready { libc::POLLIN } else { 0 };
                self.shadow_fds[i].revents = 0;
            }
            #[cfg(not(unix))]
            let _ = i;
            anyone_ready |= ready;
        }

        if !anyone_ready {
            // park on the sync handler's client instead of spinning;
            // bounded so shutdown and shadow updates stay responsive
            if let Some(client) = self.sync_handler.as_ref().and_then(|h| h.client()) {
                client.wait_for_packets_ready(Duration::from_millis(POLL_TIMEOUT_MS));
            } else {
                sys::sleep_usecs(POLL_TIMEOUT_MS * 1000);
            }
            return true;
        }

        #[cfg(unix)]
        {
            let rc = unsafe {
                libc::poll(
                    self.shadow_fds.as_mut_ptr(),
                    self.shadow_fds.len() as libc::nfds_t,
                    POLL_TIMEOUT_MS as i32,
                )
            };
            if rc < 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EINTR) {
                    return true;
                }
                log::error!("poll error: {}", errno);
                return false;
            }
            let now_ctr = firestream_clock::ticks_to_ctr(self.clock.now_ticks());
            for (i, handler) in self.shadow.iter().enumerate() {
                let revents = self.shadow_fds[i].revents;
                if revents & libc::POLLIN != 0 {
                    handler.iterate(now_ctr);
                } else if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    log::warn!("poll error/hangup on handler {}", i);
                    handler.notify_of_death();
                    self.manager_state
                        .store(IsoManagerState::Error as u8, Ordering::Release);
                }
            }
        }
        #[cfg(not(unix))]
        {
            sys::sleep_usecs(1000);
            let now_ctr = firestream_clock::ticks_to_ctr(self.clock.now_ticks());
            for handler in &self.shadow {
                if handler
                    .client()
                    .map(|c| c.packets_ready())
                    .unwrap_or(false)
                {
                    handler.iterate(now_ctr);
                }
            }
        }
        true
    }
}
