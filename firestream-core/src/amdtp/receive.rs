//! AMDTP receive depacketization.
//!
//! Validates CIP headers, recovers the presentation timestamp of the first
//! sample in each packet from the SYT field, and appends the raw wire events
//! to the stream's timestamped buffer. The event-to-port demultiplexing for
//! the client side (`process_read_block`) is the inverse of the transmit
//! multiplexer.

use std::sync::Arc;

use firestream_clock::{add_ticks, ctr_cycles, syt_recv_to_full_ticks};

use super::encode;
use super::packet::*;
use super::transmit::build_port_cache;
use crate::error::{Result, StreamError};
use crate::ports::Port;
use crate::stream::format::{
    AudioDataType, ChildReturn, FormatCtx, PacketFormat, PacketMeta, PacketOut, StreamConfig,
};

struct CachedAudioPort {
    port: Arc<Port>,
    enabled: bool,
}

struct CachedMidiPort {
    port: Arc<Port>,
    position: usize,
    location: usize,
    enabled: bool,
}

/// Receive half of an AMDTP stream.
pub struct AmdtpReceive {
    dimension: usize,
    syt_interval: usize,
    audio_type: AudioDataType,
    audio_ports: Vec<CachedAudioPort>,
    midi_ports: Vec<CachedMidiPort>,
    last_timestamp: u64,
    expected_dbc: Option<u8>,
}

impl AmdtpReceive {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            syt_interval: 0,
            audio_type: AudioDataType::Int24,
            audio_ports: Vec::new(),
            midi_ports: Vec::new(),
            last_timestamp: 0,
            expected_dbc: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn update_port_cache(&mut self) {
        for cached in &mut self.audio_ports {
            cached.enabled = cached.port.is_enabled();
        }
        for cached in &mut self.midi_ports {
            cached.enabled = cached.port.is_enabled();
        }
    }
}

impl PacketFormat for AmdtpReceive {
    fn prepare(&mut self, cfg: &StreamConfig, ports: &[Arc<Port>]) -> Result<()> {
        self.syt_interval = syt_interval_for_rate(cfg.nominal_rate)
            .ok_or_else(|| StreamError::Protocol(format!("unsupported rate {}", cfg.nominal_rate)))?
            as usize;
        self.audio_type = cfg.audio_type;
        self.expected_dbc = None;

        let (audio, midi) = build_port_cache(ports, self.dimension, self.syt_interval)?;
        self.audio_ports = audio
            .into_iter()
            .map(|(port, _)| CachedAudioPort {
                port,
                enabled: true,
            })
            .collect();
        self.midi_ports = midi
            .into_iter()
            .map(|(port, position, location)| CachedMidiPort {
                port,
                position,
                location,
                enabled: true,
            })
            .collect();
        Ok(())
    }

    fn events_per_frame(&self) -> usize {
        self.dimension
    }

    fn frames_per_packet(&self) -> usize {
        self.syt_interval
    }

    fn max_packet_size(&self) -> usize {
        CIP_HEADER_SIZE + self.syt_interval * self.dimension * 4
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn process_packet_header(
        &mut self,
        data: &[u8],
        meta: &PacketMeta,
        _ctx: &FormatCtx,
    ) -> ChildReturn {
        let hdr = match CipHeader::parse(data) {
            Some(hdr) => hdr,
            None => return ChildReturn::Invalid,
        };
        if hdr.fmt != FMT_AMDTP {
            return ChildReturn::Invalid;
        }
        if hdr.is_no_data() {
            // a valid stream, just nothing in this cycle
            return ChildReturn::Invalid;
        }
        if hdr.dbs as usize != self.dimension {
            log::error!(
                "dbs {} does not match stream dimension {}",
                hdr.dbs,
                self.dimension
            );
            return ChildReturn::XRun;
        }
        if rate_for_fdf(hdr.fdf).is_none() {
            log::error!("unknown AMDTP sample rate code {:02X}", hdr.fdf);
            return ChildReturn::XRun;
        }

        if let Some(expected) = self.expected_dbc {
            if hdr.dbc != expected {
                log::warn!("dbc discontinuity: got {}, expected {}", hdr.dbc, expected);
            }
        }
        self.expected_dbc = Some(hdr.dbc.wrapping_add(self.syt_interval as u8));

        self.last_timestamp =
            syt_recv_to_full_ticks(hdr.syt, ctr_cycles(meta.pkt_ctr), meta.pkt_ctr);
        ChildReturn::Ok
    }

    fn process_packet_data(
        &mut self,
        data: &[u8],
        _meta: &PacketMeta,
        ctx: &FormatCtx,
    ) -> ChildReturn {
        let payload = &data[CIP_HEADER_SIZE..];
        let nevents = payload.len() / (self.dimension * 4);
        if nevents == 0 {
            return ChildReturn::Ok;
        }
        let tpf = ctx.buffer.ticks_per_frame();
        // the tail timestamp is the presentation time of the slot after the
        // last frame of this packet
        let tail_ts = add_ticks(self.last_timestamp, (nevents as f64 * tpf) as u64);
        match ctx
            .buffer
            .write_frames(nevents, &payload[..nevents * self.dimension * 4], tail_ts)
        {
            Ok(()) => ChildReturn::Ok,
            Err(_) => ChildReturn::XRun,
        }
    }

    fn generate_packet_header(
        &mut self,
        _: &mut PacketOut,
        _: u32,
        _: u32,
        _: &FormatCtx,
    ) -> ChildReturn {
        log::error!("transmit callback on a receive stream");
        ChildReturn::Invalid
    }

    fn generate_packet_data(&mut self, _: &mut PacketOut, _: u32, _: &FormatCtx) -> ChildReturn {
        log::error!("transmit callback on a receive stream");
        ChildReturn::Invalid
    }

    fn generate_empty_packet(&mut self, _: &mut PacketOut, _: u32, _: &FormatCtx) -> ChildReturn {
        log::error!("transmit callback on a receive stream");
        ChildReturn::Invalid
    }

    fn generate_silent_packet(&mut self, _: &mut PacketOut, _: u32, _: &FormatCtx) -> ChildReturn {
        log::error!("transmit callback on a receive stream");
        ChildReturn::Invalid
    }

    fn process_read_block(&mut self, data: &[u8], nframes: usize, offset: usize) -> bool {
        self.update_port_cache();
        for (position, cached) in self.audio_ports.iter().enumerate() {
            if !cached.enabled || cached.port.buffer_size() < offset + nframes {
                continue;
            }
            let mut buf = cached.port.lock_buffer();
            let dst = &mut buf[offset..offset + nframes];
            match self.audio_type {
                AudioDataType::Int24 => {
                    encode::decode_audio_int24(dst, data, self.dimension, position, nframes)
                }
                AudioDataType::Float => {
                    encode::decode_audio_float(dst, data, self.dimension, position, nframes)
                }
            }
        }
        for cached in &self.midi_ports {
            if !cached.enabled || cached.port.buffer_size() < offset + nframes {
                continue;
            }
            let mut buf = cached.port.lock_buffer();
            encode::decode_midi(
                &mut buf[offset..],
                data,
                self.dimension,
                cached.position,
                cached.location,
                nframes,
            );
        }
        true
    }

    fn process_write_block(&mut self, _: &mut [u8], _: usize, _: usize) -> bool {
        log::error!("write block on a receive stream");
        false
    }

    fn silence_block(&mut self, _: &mut [u8], _: usize, _: usize) -> bool {
        true
    }
}
