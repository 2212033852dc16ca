//! Sample (de)mux between client port buffers and AMDTP event payloads.
//!
//! An event is `dimension` big-endian quadlets; audio occupies the low
//! positions with MBLA-labelled 24-bit samples, MIDI subframes sit at their
//! `(position, location)` with AM824 labels at 1x rate (one byte per eight
//! frames). On x86-64 an SSE2 path encodes four adjacent audio ports at a
//! time; its output is byte-identical to the scalar path.

use super::packet::{
    quadlet_from_wire, quadlet_to_wire, FLOAT_MULTIPLIER, LABEL_MBLA, LABEL_MIDI_1X,
    LABEL_MIDI_NO_DATA,
};
use crate::ports::MIDI_BYTE_FLAG;

/// MBLA silence, already labelled.
const SILENCE_QUADLET: u32 = (LABEL_MBLA as u32) << 24;

#[inline]
fn event_offset(frame: usize, dimension: usize, position: usize) -> usize {
    (frame * dimension + position) * 4
}

#[inline]
fn put_quadlet(out: &mut [u8], off: usize, q: u32) {
    out[off..off + 4].copy_from_slice(&quadlet_to_wire(q));
}

#[inline]
fn get_quadlet(data: &[u8], off: usize) -> u32 {
    quadlet_from_wire([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Encodes silence into one audio position for `nframes` events.
pub fn encode_audio_silence(out: &mut [u8], dimension: usize, position: usize, nframes: usize) {
    for frame in 0..nframes {
        put_quadlet(out, event_offset(frame, dimension, position), SILENCE_QUADLET);
    }
}

/// Encodes Int24 samples (low 24 bits of each slot) into one position.
pub fn encode_audio_int24(
    out: &mut [u8],
    dimension: usize,
    position: usize,
    src: &[u32],
    nframes: usize,
) {
    for frame in 0..nframes {
        let q = (src[frame] & 0x00FF_FFFF) | ((LABEL_MBLA as u32) << 24);
        put_quadlet(out, event_offset(frame, dimension, position), q);
    }
}

/// Encodes Float samples (f32 bits in each slot) into one position.
pub fn encode_audio_float(
    out: &mut [u8],
    dimension: usize,
    position: usize,
    src: &[u32],
    nframes: usize,
) {
    for frame in 0..nframes {
        let v = f32::from_bits(src[frame]) * FLOAT_MULTIPLIER;
        let tmp = (v as i32) as u32;
        let q = (tmp >> 8) | ((LABEL_MBLA as u32) << 24);
        put_quadlet(out, event_offset(frame, dimension, position), q);
    }
}

/// Decodes one audio position into Int24 slots.
pub fn decode_audio_int24(
    dst: &mut [u32],
    data: &[u8],
    dimension: usize,
    position: usize,
    nframes: usize,
) {
    for frame in 0..nframes {
        let q = get_quadlet(data, event_offset(frame, dimension, position));
        dst[frame] = q & 0x00FF_FFFF;
    }
}

/// Decodes one audio position into Float slots.
pub fn decode_audio_float(
    dst: &mut [u32],
    data: &[u8],
    dimension: usize,
    position: usize,
    nframes: usize,
) {
    for frame in 0..nframes {
        let q = get_quadlet(data, event_offset(frame, dimension, position));
        let s = (((q & 0x00FF_FFFF) << 8) as i32) >> 8;
        let f = s as f32 / 8_388_608.0;
        dst[frame] = f.to_bits();
    }
}

/// Encodes one MIDI port. Slots are sampled every eight frames starting at
/// `location`, which enforces the 1x byte-rate limit: at most one byte per
/// eight frames reaches the wire, the rest stays queued in the port buffer.
pub fn encode_midi(
    out: &mut [u8],
    dimension: usize,
    position: usize,
    location: usize,
    src: &[u32],
    nframes: usize,
) {
    let mut src_idx = 0usize;
    let mut frame = location;
    while frame < nframes {
        let off = event_offset(frame, dimension, position);
        let slot = src.get(src_idx).copied().unwrap_or(0);
        if slot & 0xFF00_0000 != 0 {
            let q = ((LABEL_MIDI_1X as u32) << 24) | ((slot & 0xFF) << 16);
            put_quadlet(out, off, q);
        } else {
            put_quadlet(out, off, (LABEL_MIDI_NO_DATA as u32) << 24);
        }
        src_idx += 8;
        frame += 8;
    }
}

/// Encodes MIDI no-data subframes for one port.
pub fn encode_midi_silence(
    out: &mut [u8],
    dimension: usize,
    position: usize,
    location: usize,
    nframes: usize,
) {
    let mut frame = location;
    while frame < nframes {
        put_quadlet(
            out,
            event_offset(frame, dimension, position),
            (LABEL_MIDI_NO_DATA as u32) << 24,
        );
        frame += 8;
    }
}

/// Decodes one MIDI port; bytes land every eight slots, mirroring the
/// encoder's sampling.
pub fn decode_midi(
    dst: &mut [u32],
    data: &[u8],
    dimension: usize,
    position: usize,
    location: usize,
    nframes: usize,
) {
    let mut dst_idx = 0usize;
    let mut frame = location;
    while frame < nframes {
        let q = get_quadlet(data, event_offset(frame, dimension, position));
        if let Some(slot) = dst.get_mut(dst_idx) {
            if (q >> 24) as u8 == LABEL_MIDI_1X {
                *slot = MIDI_BYTE_FLAG | ((q >> 16) & 0xFF);
            } else {
                *slot = 0;
            }
        }
        dst_idx += 8;
        frame += 8;
    }
}

/// SSE2 fast path: four adjacent audio positions per pass.
#[cfg(target_arch = "x86_64")]
pub mod sse2 {
    use super::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    /// Encodes Int24 for the four adjacent positions starting at
    /// `base_position`. `srcs[k]` feeds position `base_position + k`; a
    /// `None` source encodes silence for that position.
    ///
    /// Output matches [`encode_audio_int24`] byte for byte.
    pub fn encode_audio_int24_quad(
        out: &mut [u8],
        dimension: usize,
        base_position: usize,
        srcs: [Option<&[u32]>; 4],
        nframes: usize,
        scratch: &[u32],
    ) {
        debug_assert!(scratch.len() >= nframes);
        let resolved: [&[u32]; 4] = srcs.map(|s| s.unwrap_or(scratch));
        unsafe {
            let label = _mm_set1_epi32(((LABEL_MBLA as u32) << 24) as i32);
            let mask = _mm_set1_epi32(0x00FF_FFFF);
            for frame in 0..nframes {
                let v = _mm_set_epi32(
                    resolved[3][frame] as i32,
                    resolved[2][frame] as i32,
                    resolved[1][frame] as i32,
                    resolved[0][frame] as i32,
                );
                let mut q = _mm_or_si128(_mm_and_si128(v, mask), label);
                // endian conversion: 16-bit swap then 32-bit halfword swap
                q = _mm_or_si128(_mm_slli_epi16::<8>(q), _mm_srli_epi16::<8>(q));
                q = _mm_or_si128(_mm_slli_epi32::<16>(q), _mm_srli_epi32::<16>(q));
                let off = event_offset(frame, dimension, base_position);
                _mm_storeu_si128(out.as_mut_ptr().add(off) as *mut __m128i, q);
            }
        }
    }

    /// Float flavour of [`encode_audio_int24_quad`], matching
    /// [`encode_audio_float`] byte for byte for samples in `[-1.0, 1.0]`.
    pub fn encode_audio_float_quad(
        out: &mut [u8],
        dimension: usize,
        base_position: usize,
        srcs: [Option<&[u32]>; 4],
        nframes: usize,
        scratch: &[u32],
    ) {
        debug_assert!(scratch.len() >= nframes);
        let resolved: [&[u32]; 4] = srcs.map(|s| s.unwrap_or(scratch));
        unsafe {
            let label = _mm_set1_epi32(((LABEL_MBLA as u32) << 24) as i32);
            let mult = _mm_set1_ps(FLOAT_MULTIPLIER);
            for frame in 0..nframes {
                let bits = _mm_set_epi32(
                    resolved[3][frame] as i32,
                    resolved[2][frame] as i32,
                    resolved[1][frame] as i32,
                    resolved[0][frame] as i32,
                );
                let v = _mm_castsi128_ps(bits);
                let scaled = _mm_mul_ps(v, mult);
                let mut q = _mm_cvttps_epi32(scaled);
                q = _mm_srli_epi32::<8>(q);
                q = _mm_or_si128(q, label);
                q = _mm_or_si128(_mm_slli_epi16::<8>(q), _mm_srli_epi16::<8>(q));
                q = _mm_or_si128(_mm_slli_epi32::<16>(q), _mm_srli_epi32::<16>(q));
                let off = event_offset(frame, dimension, base_position);
                _mm_storeu_si128(out.as_mut_ptr().add(off) as *mut __m128i, q);
            }
        }
    }
}
