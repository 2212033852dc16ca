//! Arithmetic on the IEEE-1394 cycle timer.
//!
//! The cycle timer register (CTR) packs `seconds:7 | cycles:13 | offset:12`
//! and wraps every 128 seconds. All timestamps inside the streaming core are
//! expressed in ticks of 1/24576000 s; the helpers here convert between the
//! packed register format, plain ticks and the 16-bit SYT timestamps carried
//! in AMDTP packets, always respecting the 128 s wrap.

/// Bus cycles per second.
pub const CYCLES_PER_SECOND: u32 = 8000;
/// Ticks per bus cycle (125 us).
pub const TICKS_PER_CYCLE: u32 = 3072;
/// Half a cycle, used as the plausibility bound for register reads.
pub const TICKS_PER_HALFCYCLE: u32 = TICKS_PER_CYCLE / 2;
/// Ticks per second (24.576 MHz).
pub const TICKS_PER_SECOND: u64 = 24_576_000;
/// Ticks per microsecond.
pub const TICKS_PER_USEC: f64 = 24.576;
/// Microseconds per bus cycle.
pub const USECS_PER_CYCLE: u32 = 125;
/// The cycle timer wraps after 128 seconds worth of ticks.
pub const MAX_TICKS: u64 = 128 * TICKS_PER_SECOND;

/// Marker for "no timestamp available".
pub const INVALID_TIMESTAMP_TICKS: u64 = u64::MAX;

/// Seconds field of a packed CTR value.
#[inline]
pub fn ctr_seconds(ctr: u32) -> u32 {
    (ctr & 0xFE00_0000) >> 25
}

/// Cycles field of a packed CTR value.
#[inline]
pub fn ctr_cycles(ctr: u32) -> u32 {
    (ctr & 0x01FF_F000) >> 12
}

/// Offset field (ticks within the cycle) of a packed CTR value.
#[inline]
pub fn ctr_offset(ctr: u32) -> u32 {
    ctr & 0x0000_0FFF
}

/// Converts a packed CTR value to ticks.
#[inline]
pub fn ctr_to_ticks(ctr: u32) -> u64 {
    ctr_seconds(ctr) as u64 * TICKS_PER_SECOND
        + ctr_cycles(ctr) as u64 * TICKS_PER_CYCLE as u64
        + ctr_offset(ctr) as u64
}

/// Seconds part of a tick timestamp.
#[inline]
pub fn ticks_to_seconds(ticks: u64) -> u64 {
    ticks / TICKS_PER_SECOND
}

/// Cycle number (0..8000) of a tick timestamp.
#[inline]
pub fn ticks_to_cycles(ticks: u64) -> u32 {
    ((ticks / TICKS_PER_CYCLE as u64) % CYCLES_PER_SECOND as u64) as u32
}

/// Intra-cycle offset of a tick timestamp.
#[inline]
pub fn ticks_to_offset(ticks: u64) -> u32 {
    (ticks % TICKS_PER_CYCLE as u64) as u32
}

/// Packs a tick timestamp into CTR format.
#[inline]
pub fn ticks_to_ctr(ticks: u64) -> u32 {
    ((ticks_to_seconds(ticks) as u32 & 0x7F) << 25)
        | ((ticks_to_cycles(ticks) & 0x1FFF) << 12)
        | (ticks_to_offset(ticks) & 0xFFF)
}

/// Extracts the 16-bit SYT form of a tick timestamp: the low 4 bits of the
/// cycle number and the 12-bit offset.
#[inline]
pub fn ticks_to_syt(ticks: u64) -> u16 {
    (((ticks_to_cycles(ticks) & 0xF) << 12) | (ticks_to_offset(ticks) & 0xFFF)) as u16
}

/// Wraps a tick value into `[0, 128 s)` from above.
#[inline]
pub fn wrap_at_max_ticks(ticks: u64) -> u64 {
    if ticks >= MAX_TICKS {
        ticks - MAX_TICKS
    } else {
        ticks
    }
}

/// Wraps a signed tick value into `[0, 128 s)` from below.
#[inline]
pub fn wrap_at_min_ticks(ticks: i64) -> u64 {
    if ticks < 0 {
        (ticks + MAX_TICKS as i64) as u64
    } else {
        ticks as u64
    }
}

/// Wraps a signed tick value into `[0, 128 s)` from either side.
#[inline]
pub fn wrap_at_min_max_ticks(ticks: i64) -> u64 {
    if ticks < 0 {
        (ticks + MAX_TICKS as i64) as u64
    } else if ticks >= MAX_TICKS as i64 {
        (ticks - MAX_TICKS as i64) as u64
    } else {
        ticks as u64
    }
}

/// Signed difference `x - y` between two wrapped tick timestamps.
///
/// If one of the operands has wrapped and the other has not, the raw
/// difference exceeds half the wrap range; the result is unwrapped so that
/// it always lies in `(-64 s, 64 s]`.
#[inline]
pub fn diff_ticks(x: u64, y: u64) -> i64 {
    let mut diff = x as i64 - y as i64;
    let max = MAX_TICKS as i64 / 2;
    if diff > max {
        // y wrapped, x did not
        diff -= MAX_TICKS as i64;
    } else if diff < -max {
        // x wrapped, y did not
        diff += MAX_TICKS as i64;
    }
    diff
}

/// Sum of two tick timestamps, wrapped at 128 s.
#[inline]
pub fn add_ticks(x: u64, y: u64) -> u64 {
    wrap_at_max_ticks(x + y)
}

/// Difference of two tick timestamps, wrapped at 128 s.
#[inline]
pub fn sub_ticks(x: u64, y: u64) -> u64 {
    wrap_at_min_ticks(x as i64 - y as i64)
}

/// Signed difference `x - y` between two cycle numbers, unwrapped into
/// `[-4000, 4000]`.
#[inline]
pub fn diff_cycles(x: u32, y: u32) -> i32 {
    let mut diff = x as i32 - y as i32;
    let max = CYCLES_PER_SECOND as i32 / 2;
    if diff > max {
        diff -= CYCLES_PER_SECOND as i32;
    } else if diff < -max {
        diff += CYCLES_PER_SECOND as i32;
    }
    diff
}

/// Sum of two cycle numbers, wrapped at 8000.
#[inline]
pub fn add_cycles(x: u32, y: u32) -> u32 {
    let sum = x + y;
    if sum >= CYCLES_PER_SECOND {
        sum - CYCLES_PER_SECOND
    } else {
        sum
    }
}

/// Reconstructs a full tick timestamp from a received SYT field.
///
/// `rcv_cycle` is the bus cycle the packet was received on and `ctr_now` the
/// current cycle timer. Causality puts `ctr_now` at or after the receive
/// cycle; if the cycle field of `ctr_now` is smaller than `rcv_cycle` the
/// timer wrapped since reception and the seconds count is stepped back. The
/// SYT cycle (4 bits) is unwrapped forward when it lies before the receive
/// cycle's low bits.
pub fn syt_recv_to_full_ticks(syt_timestamp: u16, rcv_cycle: u32, ctr_now: u32) -> u64 {
    let cc_cycles = ctr_cycles(ctr_now);
    let mut cc_seconds = ctr_seconds(ctr_now);

    // the cycle timer should be ahead of the receive cycle
    let dc = diff_cycles(cc_cycles, rcv_cycle);
    if dc < 0 {
        log::warn!(
            "current cycle timer not ahead of receive cycle: rcv {} / cc {} ({})",
            rcv_cycle,
            cc_cycles,
            dc
        );
    }

    // the timer wrapped since this packet was received; seconds should
    // reflect the moment of reception
    if rcv_cycle > cc_cycles && dc >= 0 {
        cc_seconds = if cc_seconds == 0 { 127 } else { cc_seconds - 1 };
    }

    let rcv_cycle_masked = rcv_cycle & 0xF;
    let mut syt_cycle = ((syt_timestamp as u32) >> 12) & 0xF;
    if syt_cycle < rcv_cycle_masked {
        syt_cycle += 0x10;
    }
    let delta_cycles = syt_cycle - rcv_cycle_masked;

    let mut new_cycles = rcv_cycle + delta_cycles;
    let mut timestamp;
    if new_cycles < CYCLES_PER_SECOND {
        timestamp = new_cycles as u64 * TICKS_PER_CYCLE as u64;
    } else {
        new_cycles -= CYCLES_PER_SECOND;
        timestamp = new_cycles as u64 * TICKS_PER_CYCLE as u64;
        // one second was crossed by the cycle unwrap
        timestamp += TICKS_PER_SECOND;
    }

    timestamp += (syt_timestamp & 0xFFF) as u64;
    let timestamp = add_ticks(timestamp, cc_seconds as u64 * TICKS_PER_SECOND);

    if (ticks_to_ctr(timestamp) & 0xFFFF) as u16 != syt_timestamp {
        log::warn!(
            "back-converted timestamp {} does not re-encode to SYT {:04X}",
            timestamp,
            syt_timestamp
        );
        debug_assert!(false, "SYT reconstruction mismatch");
    }
    timestamp
}

/// Reconstructs a full tick timestamp from a SYT field to be transmitted.
///
/// Differs from [`syt_recv_to_full_ticks`] only in the wrap direction: the
/// transmit cycle lies in the future, so when the current cycle is ahead of
/// `xmt_cycle` the timer will wrap before transmission and the seconds count
/// is stepped forward.
pub fn syt_xmit_to_full_ticks(syt_timestamp: u16, xmt_cycle: u32, ctr_now: u32) -> u64 {
    let cc_cycles = ctr_cycles(ctr_now);
    let mut cc_seconds = ctr_seconds(ctr_now);

    let dc = diff_cycles(xmt_cycle, cc_cycles);
    if dc < 0 {
        log::warn!(
            "xmit cycle not ahead of current cycle: xmt {} / cc {} ({})",
            xmt_cycle,
            cc_cycles,
            dc
        );
    }

    if cc_cycles > xmt_cycle && dc >= 0 {
        cc_seconds = (cc_seconds + 1) & 0x7F;
    }

    let xmt_cycle_masked = xmt_cycle & 0xF;
    let mut syt_cycle = ((syt_timestamp as u32) >> 12) & 0xF;
    if syt_cycle < xmt_cycle_masked {
        syt_cycle += 0x10;
    }
    let delta_cycles = syt_cycle - xmt_cycle_masked;

    let mut new_cycles = xmt_cycle + delta_cycles;
    let mut timestamp;
    if new_cycles < CYCLES_PER_SECOND {
        timestamp = new_cycles as u64 * TICKS_PER_CYCLE as u64;
    } else {
        new_cycles -= CYCLES_PER_SECOND;
        timestamp = new_cycles as u64 * TICKS_PER_CYCLE as u64;
        timestamp += TICKS_PER_SECOND;
    }

    timestamp += (syt_timestamp & 0xFFF) as u64;
    let timestamp = add_ticks(timestamp, cc_seconds as u64 * TICKS_PER_SECOND);

    if (ticks_to_ctr(timestamp) & 0xFFFF) as u16 != syt_timestamp {
        log::warn!(
            "back-converted timestamp {} does not re-encode to SYT {:04X}",
            timestamp,
            syt_timestamp
        );
        debug_assert!(false, "SYT reconstruction mismatch");
    }
    timestamp
}
