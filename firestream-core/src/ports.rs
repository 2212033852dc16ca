//! Client-visible ports of a stream.
//!
//! A port is one channel of audio, one MIDI stream or one control stream,
//! backed by a period-sized buffer of 32-bit slots the client reads or
//! writes between `wait_for_period` and `transfer`. Audio slots hold either
//! a 24-bit sample in the low bits (Int24) or `f32` bits (Float); MIDI
//! slots carry `0x0100_0000 | byte` when a byte is present, 0 otherwise.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

/// Which way the port's data flows, seen from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// Device to application (receive streams).
    Capture,
    /// Application to device (transmit streams).
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Audio,
    Midi,
    Control,
}

/// Marker value for a MIDI slot carrying a byte.
pub const MIDI_BYTE_FLAG: u32 = 0x0100_0000;

pub struct Port {
    name: String,
    port_type: PortType,
    direction: PortDirection,
    /// Quadlet index inside an AMDTP event.
    position: u32,
    /// For MIDI: frame slot inside an 8-frame group.
    location: u32,
    enabled: AtomicBool,
    buffer: Mutex<Vec<u32>>,
}

impl Port {
    pub fn new_audio(name: impl Into<String>, direction: PortDirection, position: u32) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Audio,
            direction,
            position,
            location: 0,
            enabled: AtomicBool::new(true),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn new_midi(
        name: impl Into<String>,
        direction: PortDirection,
        position: u32,
        location: u32,
    ) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Midi,
            direction,
            position,
            location,
            enabled: AtomicBool::new(true),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn new_control(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            port_type: PortType::Control,
            direction,
            position: 0,
            location: 0,
            enabled: AtomicBool::new(true),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn location(&self) -> u32 {
        self.location
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Resizes the period buffer, zero-filled.
    pub fn set_buffer_size(&self, frames: usize) {
        let mut buf = self.buffer.lock();
        buf.clear();
        buf.resize(frames, 0);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Locks the buffer for the duration of one encode/decode pass. The
    /// packet path uses this to hold several port buffers at once.
    pub fn lock_buffer(&self) -> MappedMutexGuard<'_, [u32]> {
        MutexGuard::map(self.buffer.lock(), |v| v.as_mut_slice())
    }

    /// Runs `f` over the port buffer (shared).
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u32]) -> R) -> R {
        f(&self.buffer.lock())
    }

    /// Runs `f` over the port buffer (exclusive).
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u32]) -> R) -> R {
        f(&mut self.buffer.lock())
    }

    /// Copies raw slots into the buffer (playback side of the client).
    pub fn write_slots(&self, src: &[u32]) {
        let mut buf = self.buffer.lock();
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
    }

    /// Copies raw slots out of the buffer (capture side of the client).
    pub fn read_slots(&self, dst: &mut [u32]) {
        let buf = self.buffer.lock();
        let n = dst.len().min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
    }

    /// Stores float samples as raw bits (Float audio data type).
    pub fn write_audio_f32(&self, src: &[f32]) {
        let mut buf = self.buffer.lock();
        for (slot, &s) in buf.iter_mut().zip(src.iter()) {
            *slot = s.to_bits();
        }
    }

    /// Reads float samples back from raw bits.
    pub fn read_audio_f32(&self, dst: &mut [f32]) {
        let buf = self.buffer.lock();
        for (d, &slot) in dst.iter_mut().zip(buf.iter()) {
            *d = f32::from_bits(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_port_basics() {
        let p = Port::new_audio("pcm_out_1", PortDirection::Playback, 0);
        assert_eq!(p.port_type(), PortType::Audio);
        assert!(p.is_enabled());
        p.set_enabled(false);
        assert!(!p.is_enabled());

        p.set_buffer_size(16);
        assert_eq!(p.buffer_size(), 16);
        p.write_slots(&[1, 2, 3]);
        let mut out = [0u32; 3];
        p.read_slots(&mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_float_roundtrip() {
        let p = Port::new_audio("pcm_in_1", PortDirection::Capture, 1);
        p.set_buffer_size(4);
        p.write_audio_f32(&[0.5, -0.25, 1.0, 0.0]);
        let mut out = [0f32; 4];
        p.read_audio_f32(&mut out);
        assert_eq!(out, [0.5, -0.25, 1.0, 0.0]);
    }

    #[test]
    fn test_midi_port_placement() {
        let p = Port::new_midi("midi_out", PortDirection::Playback, 4, 2);
        assert_eq!(p.position(), 4);
        assert_eq!(p.location(), 2);
    }
}
