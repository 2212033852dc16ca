//! Platform helpers: monotonic time, absolute sleeps, realtime priority.
//!
//! The DLL thread needs to wake at absolute instants (relative sleeps would
//! accumulate scheduling error into the loop period), and both the timer and
//! the iso task want realtime scheduling.

#[cfg(unix)]
mod imp {
    /// Monotonic host time in microseconds.
    pub fn now_usecs() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1000
    }

    /// Sleeps until the absolute monotonic time `when` (microseconds).
    /// Returns immediately if `when` is in the past.
    pub fn sleep_until_usecs(when: u64) {
        let ts = libc::timespec {
            tv_sec: (when / 1_000_000) as libc::time_t,
            tv_nsec: ((when % 1_000_000) * 1000) as libc::c_long,
        };
        loop {
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            if rc != libc::EINTR {
                break;
            }
        }
    }

    /// Requests SCHED_FIFO scheduling at `priority` for the calling thread.
    /// Returns false (and logs) when the privilege is not available.
    pub fn set_realtime_priority(priority: i32) -> bool {
        let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
        let prio = priority.clamp(1, if max > 0 { max } else { 99 });
        let param = libc::sched_param {
            sched_priority: prio,
        };
        let rc = unsafe {
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if rc != 0 {
            log::warn!("could not acquire SCHED_FIFO priority {}: errno {}", prio, rc);
            return false;
        }
        true
    }
}

#[cfg(not(unix))]
mod imp {
    use std::sync::OnceLock;
    use std::time::Instant;

    fn epoch() -> Instant {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        *EPOCH.get_or_init(Instant::now)
    }

    pub fn now_usecs() -> u64 {
        epoch().elapsed().as_micros() as u64
    }

    pub fn sleep_until_usecs(when: u64) {
        let now = now_usecs();
        if when > now {
            std::thread::sleep(std::time::Duration::from_micros(when - now));
        }
    }

    pub fn set_realtime_priority(_priority: i32) -> bool {
        false
    }
}

pub use imp::{now_usecs, set_realtime_priority, sleep_until_usecs};

/// Relative sleep in microseconds.
pub fn sleep_usecs(usecs: u64) {
    std::thread::sleep(std::time::Duration::from_micros(usecs));
}
