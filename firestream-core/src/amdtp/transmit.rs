//! AMDTP transmit packetization.
//!
//! Pulls wire-format frames out of the stream's timestamped buffer and wraps
//! them in CIP headers, timing each packet against the presentation time of
//! its first sample. The port-to-event multiplexing for the client side
//! (`process_write_block`) lives here too, driven through the port cache so
//! the packet path never walks a port map.

use std::sync::Arc;

use firestream_clock::{diff_cycles, sub_ticks, ticks_to_cycles, ticks_to_syt, TICKS_PER_CYCLE};

use super::encode;
use super::packet::*;
use crate::error::{Result, StreamError};
use crate::ports::{Port, PortType};
use crate::stream::format::{
    AudioDataType, ChildReturn, FormatCtx, PacketFormat, PacketMeta, PacketOut, StreamConfig,
};

/// Largest AMDTP packet we will ever produce.
pub const AMDTP_MAX_PACKET_SIZE: usize = 2048;

/// Ticks between queueing a packet and its presentation on the device
/// (the IEC 61883 transfer delay, 3 cycles).
pub const TRANSMIT_TRANSFER_DELAY: u64 = 3 * TICKS_PER_CYCLE as u64;

/// How many cycles before its transmit window a packet may be queued.
pub const MAX_CYCLES_TO_TRANSMIT_EARLY: i32 = 15;

/// Minimum headroom before presentation when the buffer runs dry; any
/// closer and the stream has xrun.
pub const MIN_CYCLES_BEFORE_PRESENTATION: i32 = 1;

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

/// Transmit half of an AMDTP stream.
pub struct AmdtpTransmit {
    dimension: usize,
    syt_interval: usize,
    fdf: u8,
    dbc: u8,
    node_id: u8,
    audio_type: AudioDataType,
    /// Some devices (DICE family) reject no-data packets with payload.
    send_nodata_payload: bool,
    audio_ports: Vec<CachedAudioPort>,
    midi_ports: Vec<CachedMidiPort>,
    /// One period of zero slots, stands in for disabled port buffers.
    scratch: Vec<u32>,
    last_timestamp: u64,
}

impl AmdtpTransmit {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            syt_interval: 0,
            fdf: 0,
            dbc: 0,
            node_id: 0,
            audio_type: AudioDataType::Int24,
            send_nodata_payload: true,
            audio_ports: Vec::new(),
            midi_ports: Vec::new(),
            scratch: Vec::new(),
            last_timestamp: 0,
        }
    }

    pub fn set_send_nodata_payload(&mut self, send: bool) {
        self.send_nodata_payload = send;
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn payload_bytes(&self) -> usize {
        self.syt_interval * self.dimension * 4
    }

    /// Fills the CIP header of a data packet and advances dbc.
    fn fill_data_header(&mut self, out: &mut PacketOut) {
        let syt = ticks_to_syt(self.last_timestamp);
        CipHeader::data(self.node_id, self.dimension as u8, self.dbc, self.fdf, syt)
            .write_to(out.data);
        self.dbc = self.dbc.wrapping_add(self.syt_interval as u8);
        out.length = CIP_HEADER_SIZE + self.payload_bytes();
        out.tag = TAG_WITH_CIP;
        out.sy = 0;
    }

    /// Fills a no-data header; dbc only advances when a payload is carried.
    fn fill_nodata_header(&mut self, out: &mut PacketOut) {
        CipHeader::no_data(self.node_id, self.dimension as u8, self.dbc).write_to(out.data);
        out.tag = TAG_WITH_CIP;
        out.sy = 0;
        if self.send_nodata_payload {
            let len = CIP_HEADER_SIZE + self.payload_bytes();
            out.data[CIP_HEADER_SIZE..len].fill(0);
            out.length = len;
            self.dbc = self.dbc.wrapping_add(self.syt_interval as u8);
        } else {
            out.length = CIP_HEADER_SIZE;
        }
    }

    /// Copies the volatile port fields into the cache. Called once per
    /// encoded block.
    fn update_port_cache(&mut self) {
        for cached in &mut self.audio_ports {
            cached.enabled = cached.port.is_enabled();
        }
        for cached in &mut self.midi_ports {
            cached.enabled = cached.port.is_enabled();
        }
    }

    fn encode_audio(&self, data: &mut [u8], nframes: usize, offset: usize) {
        let guards: Vec<_> = self
            .audio_ports
            .iter()
            .map(|cached| {
                if cached.enabled && cached.port.buffer_size() >= offset + nframes {
                    Some(cached.port.lock_buffer())
                } else {
                    None
                }
            })
            .collect();

        let nb_audio = self.audio_ports.len();
        let mut position = 0;

        #[cfg(target_arch = "x86_64")]
        {
            while position + 4 <= nb_audio {
                let srcs: [Option<&[u32]>; 4] = [0, 1, 2, 3].map(|k| {
                    guards[position + k]
                        .as_deref()
                        .map(|b| &b[offset..offset + nframes])
                });
                match self.audio_type {
                    AudioDataType::Int24 => encode::sse2::encode_audio_int24_quad(
                        data,
                        self.dimension,
                        position,
                        srcs,
                        nframes,
                        &self.scratch,
                    ),
                    AudioDataType::Float => encode::sse2::encode_audio_float_quad(
                        data,
                        self.dimension,
                        position,
                        srcs,
                        nframes,
                        &self.scratch,
                    ),
                }
                position += 4;
            }
        }

        while position < nb_audio {
            match guards[position].as_deref() {
                Some(buf) => {
                    let src = &buf[offset..offset + nframes];
                    match self.audio_type {
                        AudioDataType::Int24 => {
                            encode::encode_audio_int24(data, self.dimension, position, src, nframes)
                        }
                        AudioDataType::Float => {
                            encode::encode_audio_float(data, self.dimension, position, src, nframes)
                        }
                    }
                }
                None => encode::encode_audio_silence(data, self.dimension, position, nframes),
            }
            position += 1;
        }
    }

    fn encode_midi(&self, data: &mut [u8], nframes: usize, offset: usize) {
        for cached in &self.midi_ports {
            if cached.enabled && cached.port.buffer_size() >= offset + nframes {
                let buf = cached.port.lock_buffer();
                encode::encode_midi(
                    data,
                    self.dimension,
                    cached.position,
                    cached.location,
                    &buf[offset..],
                    nframes,
                );
            } else {
                encode::encode_midi_silence(
                    data,
                    self.dimension,
                    cached.position,
                    cached.location,
                    nframes,
                );
            }
        }
    }
}

/// Builds the position-sorted port cache shared by both AMDTP directions.
pub(super) fn build_port_cache(
    ports: &[Arc<Port>],
    dimension: usize,
    syt_interval: usize,
) -> Result<(Vec<(Arc<Port>, usize)>, Vec<(Arc<Port>, usize, usize)>)> {
    let nb_audio = ports
        .iter()
        .filter(|p| p.port_type() == PortType::Audio)
        .count();

    let mut audio = Vec::with_capacity(nb_audio);
    for position in 0..nb_audio {
        let port = ports
            .iter()
            .find(|p| p.port_type() == PortType::Audio && p.position() as usize == position)
            .ok_or_else(|| {
                StreamError::Protocol(format!("no audio port for position {}", position))
            })?;
        if position >= dimension {
            return Err(StreamError::Protocol(format!(
                "audio port position {} exceeds dimension {}",
                position, dimension
            )));
        }
        audio.push((port.clone(), position));
    }

    let mut midi = Vec::new();
    for port in ports.iter().filter(|p| p.port_type() == PortType::Midi) {
        let position = port.position() as usize;
        let location = port.location() as usize;
        if position >= dimension {
            return Err(StreamError::Protocol(format!(
                "MIDI port position {} exceeds dimension {}",
                position, dimension
            )));
        }
        if location >= 8.min(syt_interval) {
            return Err(StreamError::Protocol(format!(
                "MIDI port location {} out of range",
                location
            )));
        }
        midi.push((port.clone(), position, location));
    }

    Ok((audio, midi))
}

impl PacketFormat for AmdtpTransmit {
    fn prepare(&mut self, cfg: &StreamConfig, ports: &[Arc<Port>]) -> Result<()> {
        self.syt_interval = syt_interval_for_rate(cfg.nominal_rate)
            .ok_or_else(|| StreamError::Protocol(format!("unsupported rate {}", cfg.nominal_rate)))?
            as usize;
        self.fdf = fdf_for_rate(cfg.nominal_rate)
            .ok_or_else(|| StreamError::Protocol(format!("unsupported rate {}", cfg.nominal_rate)))?;
        self.node_id = cfg.local_node_id & 0x3F;
        self.audio_type = cfg.audio_type;
        self.dbc = 0;

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

        self.scratch.clear();
        self.scratch.resize(cfg.period_size, 0);

        if self.max_packet_size() > AMDTP_MAX_PACKET_SIZE {
            return Err(StreamError::Protocol(format!(
                "packet size {} exceeds AMDTP maximum",
                self.max_packet_size()
            )));
        }
        Ok(())
    }

    fn events_per_frame(&self) -> usize {
        self.dimension
    }

    fn frames_per_packet(&self) -> usize {
        self.syt_interval
    }

    fn max_packet_size(&self) -> usize {
        CIP_HEADER_SIZE + self.payload_bytes()
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn process_packet_header(&mut self, _: &[u8], _: &PacketMeta, _: &FormatCtx) -> ChildReturn {
        log::error!("receive callback on a transmit stream");
        ChildReturn::Invalid
    }

    fn process_packet_data(&mut self, _: &[u8], _: &PacketMeta, _: &FormatCtx) -> ChildReturn {
        log::error!("receive callback on a transmit stream");
        ChildReturn::Invalid
    }

    fn generate_packet_header(
        &mut self,
        out: &mut PacketOut,
        cycle: u32,
        dropped_cycles: u32,
        ctx: &FormatCtx,
    ) -> ChildReturn {
        // the buffer head timestamp is the presentation time of the next
        // block of frames
        let (presentation_time, fc) = ctx.buffer.head_timestamp();
        self.last_timestamp = presentation_time;

        let transmit_at_time = sub_ticks(presentation_time, TRANSMIT_TRANSFER_DELAY);
        let presentation_cycle = ticks_to_cycles(presentation_time);
        let transmit_at_cycle = ticks_to_cycles(transmit_at_time);
        let cycles_until_presentation = diff_cycles(presentation_cycle, cycle);
        let cycles_until_transmit = diff_cycles(transmit_at_cycle, cycle);

        if dropped_cycles > 0 {
            log::debug!(
                "gen hdr after drop: cy {:04} tc {:04} cut {} tsp {}",
                cycle,
                transmit_at_cycle,
                cycles_until_transmit,
                presentation_time
            );
        }

        if fc < self.syt_interval {
            // not a full packet buffered; harmless while presentation is
            // still far enough out
            if cycles_until_presentation <= MIN_CYCLES_BEFORE_PRESENTATION {
                log::warn!(
                    "insufficient frames: fc {} cy {:04} tc {:04} cut {}",
                    fc,
                    cycle,
                    transmit_at_cycle,
                    cycles_until_transmit
                );
                ChildReturn::XRun
            } else {
                ChildReturn::Again
            }
        } else if cycles_until_transmit < 0 {
            log::warn!(
                "too late: cy {:04} tc {:04} cut {} tsp {}",
                cycle,
                transmit_at_cycle,
                cycles_until_transmit,
                presentation_time
            );
            ChildReturn::XRun
        } else if cycles_until_transmit <= MAX_CYCLES_TO_TRANSMIT_EARLY {
            self.fill_data_header(out);
            if fc < 2 * self.syt_interval {
                ChildReturn::Defer
            } else {
                ChildReturn::Packet
            }
        } else {
            ChildReturn::EmptyPacket
        }
    }

    fn generate_packet_data(
        &mut self,
        out: &mut PacketOut,
        _cycle: u32,
        ctx: &FormatCtx,
    ) -> ChildReturn {
        let bytes = self.payload_bytes();
        match ctx.buffer.read_frames(
            self.syt_interval,
            &mut out.data[CIP_HEADER_SIZE..CIP_HEADER_SIZE + bytes],
        ) {
            Ok(()) => ChildReturn::Ok,
            Err(_) => ChildReturn::XRun,
        }
    }

    fn generate_empty_packet(
        &mut self,
        out: &mut PacketOut,
        _cycle: u32,
        _ctx: &FormatCtx,
    ) -> ChildReturn {
        self.fill_nodata_header(out);
        ChildReturn::Ok
    }

    fn generate_silent_packet(
        &mut self,
        out: &mut PacketOut,
        _cycle: u32,
        _ctx: &FormatCtx,
    ) -> ChildReturn {
        self.fill_nodata_header(out);
        ChildReturn::Packet
    }

    fn process_read_block(&mut self, _: &[u8], _: usize, _: usize) -> bool {
        log::error!("read block on a transmit stream");
        false
    }

    fn process_write_block(&mut self, data: &mut [u8], nframes: usize, offset: usize) -> bool {
        self.update_port_cache();
        self.encode_audio(data, nframes, offset);
        self.encode_midi(data, nframes, offset);
        true
    }

    fn silence_block(&mut self, data: &mut [u8], nframes: usize, _offset: usize) -> bool {
        for position in 0..self.audio_ports.len() {
            encode::encode_audio_silence(data, self.dimension, position, nframes);
        }
        for cached in &self.midi_ports {
            encode::encode_midi_silence(
                data,
                self.dimension,
                cached.position,
                cached.location,
                nframes,
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TimestampedBuffer;
    use crate::ports::PortDirection;
    use crate::testing::MockClock;
    use firestream_clock::add_ticks;

    fn test_cfg() -> StreamConfig {
        StreamConfig {
            period_size: 64,
            nb_buffers: 3,
            nominal_rate: 48_000,
            audio_type: AudioDataType::Int24,
            local_node_id: 0x11,
        }
    }

    fn test_ports(cfg: &StreamConfig) -> Vec<Arc<Port>> {
        let mut ports: Vec<Arc<Port>> = (0..4)
            .map(|i| {
                Arc::new(Port::new_audio(
                    format!("pcm_out_{}", i),
                    PortDirection::Playback,
                    i,
                ))
            })
            .collect();
        ports.push(Arc::new(Port::new_midi(
            "midi_out",
            PortDirection::Playback,
            4,
            0,
        )));
        for p in &ports {
            p.set_buffer_size(cfg.period_size);
        }
        ports
    }

    fn prepared_buffer(cfg: &StreamConfig, dimension: usize) -> TimestampedBuffer {
        let b = TimestampedBuffer::new();
        b.set_event_size(4);
        b.set_events_per_frame(dimension);
        b.set_buffer_size((cfg.nb_buffers + 1) * cfg.period_size);
        b.set_update_period(cfg.period_size);
        b.set_nominal_rate(cfg.nominal_ticks_per_frame());
        b.prepare().unwrap();
        b
    }

    fn fill_frames(buffer: &TimestampedBuffer, dimension: usize, nframes: usize, tail_ts: u64) {
        let src = vec![0u8; nframes * dimension * 4];
        buffer.write_frames(nframes, &src, tail_ts).unwrap();
    }

    struct Setup {
        tx: AmdtpTransmit,
        buffer: TimestampedBuffer,
        clock: MockClock,
        cfg: StreamConfig,
    }

    fn setup() -> Setup {
        let cfg = test_cfg();
        let ports = test_ports(&cfg);
        let mut tx = AmdtpTransmit::new(5);
        tx.prepare(&cfg, &ports).unwrap();
        let buffer = prepared_buffer(&cfg, 5);
        Setup {
            tx,
            buffer,
            clock: MockClock::new(0),
            cfg,
        }
    }

    fn gen_header(s: &mut Setup, cycle: u32) -> (ChildReturn, Vec<u8>, usize) {
        let mut data = vec![0u8; AMDTP_MAX_PACKET_SIZE];
        let mut out = PacketOut {
            data: &mut data,
            length: 0,
            tag: 0,
            sy: 0,
        };
        let ctx = FormatCtx {
            buffer: &s.buffer,
            clock: &s.clock,
            cfg: &s.cfg,
        };
        let ret = s.tx.generate_packet_header(&mut out, cycle, 0, &ctx);
        let length = out.length;
        (ret, data, length)
    }

    #[test]
    fn test_packet_in_window() {
        let mut s = setup();
        // head timestamp lands on cycle 100
        let head_ts = 100 * TICKS_PER_CYCLE as u64 + 500;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        fill_frames(&s.buffer, 5, 16, add_ticks(head_ts, 16 * 512));

        // transmit_at cycle = 97; asking at cycle 96 is inside the window
        let (ret, data, length) = gen_header(&mut s, 96);
        assert_eq!(ret, ChildReturn::Packet);
        assert_eq!(length, 8 + 8 * 5 * 4);
        let hdr = CipHeader::parse(&data).unwrap();
        assert_eq!(hdr.dbs, 5);
        assert_eq!(hdr.fdf, 0x02);
        assert_eq!(hdr.sid, 0x11);
        assert!(!hdr.is_no_data());
    }

    #[test]
    fn test_too_late_is_xrun() {
        let mut s = setup();
        let head_ts = 100 * TICKS_PER_CYCLE as u64;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        fill_frames(&s.buffer, 5, 16, add_ticks(head_ts, 16 * 512));

        // transmit_at cycle = 97; cycle 99 is past it
        let (ret, _, _) = gen_header(&mut s, 99);
        assert_eq!(ret, ChildReturn::XRun);
    }

    #[test]
    fn test_too_early_is_empty_packet() {
        let mut s = setup();
        let head_ts = 200 * TICKS_PER_CYCLE as u64;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        fill_frames(&s.buffer, 5, 16, add_ticks(head_ts, 16 * 512));

        // transmit_at cycle = 197, window starts at 182; cycle 150 is early
        let (ret, _, _) = gen_header(&mut s, 150);
        assert_eq!(ret, ChildReturn::EmptyPacket);
    }

    #[test]
    fn test_low_water_defers() {
        let mut s = setup();
        let head_ts = 100 * TICKS_PER_CYCLE as u64;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        // only one packet's worth buffered
        fill_frames(&s.buffer, 5, 8, add_ticks(head_ts, 8 * 512));

        let (ret, _, _) = gen_header(&mut s, 96);
        assert_eq!(ret, ChildReturn::Defer);
    }

    #[test]
    fn test_no_frames_far_ahead_asks_again() {
        let mut s = setup();
        // presentation far in the future, empty buffer
        s.buffer
            .set_buffer_tail_timestamp(1000 * TICKS_PER_CYCLE as u64);
        let (ret, _, _) = gen_header(&mut s, 100);
        assert_eq!(ret, ChildReturn::Again);
    }

    #[test]
    fn test_no_frames_near_presentation_is_xrun() {
        let mut s = setup();
        let head_ts = 100 * TICKS_PER_CYCLE as u64;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        // cycle right at presentation, nothing buffered
        let (ret, _, _) = gen_header(&mut s, 100);
        assert_eq!(ret, ChildReturn::XRun);
    }

    #[test]
    fn test_dbc_advances_per_data_packet() {
        let mut s = setup();
        let head_ts = 100 * TICKS_PER_CYCLE as u64;
        s.buffer.set_buffer_tail_timestamp(head_ts);
        fill_frames(&s.buffer, 5, 32, add_ticks(head_ts, 32 * 512));

        let mut dbcs = Vec::new();
        for k in 0..3u32 {
            // the head advances 8 frames (~1.3 cycles) per packet
            let (ret, data, _) = gen_header(&mut s, 96 + k);
            assert!(matches!(ret, ChildReturn::Packet | ChildReturn::Defer));
            dbcs.push(CipHeader::parse(&data).unwrap().dbc);
            // consume the packet's frames like generate_packet_data would
            s.buffer.drop_frames(8).unwrap();
        }
        assert_eq!(dbcs, vec![0, 8, 16]);
    }

    #[test]
    fn test_nodata_packet_flavours() {
        let mut s = setup();
        let mut data = vec![0u8; AMDTP_MAX_PACKET_SIZE];
        let mut out = PacketOut {
            data: &mut data,
            length: 0,
            tag: 0,
            sy: 0,
        };
        let ctx = FormatCtx {
            buffer: &s.buffer,
            clock: &s.clock,
            cfg: &s.cfg,
        };
        s.tx.generate_empty_packet(&mut out, 0, &ctx);
        assert_eq!(out.length, 8 + 8 * 5 * 4);
        let hdr = CipHeader::parse(out.data).unwrap();
        assert!(hdr.is_no_data());
        assert_eq!(hdr.dbc, 0);

        // without payload the dbc must not advance either
        s.tx.set_send_nodata_payload(false);
        let mut out2 = PacketOut {
            data: &mut data,
            length: 0,
            tag: 0,
            sy: 0,
        };
        s.tx.generate_empty_packet(&mut out2, 0, &ctx);
        assert_eq!(out2.length, 8);
        assert_eq!(CipHeader::parse(out2.data).unwrap().dbc, 8);
    }

    #[test]
    fn test_prepare_rejects_bad_midi_location() {
        let cfg = test_cfg();
        let ports = vec![
            Arc::new(Port::new_audio("a", PortDirection::Playback, 0)),
            Arc::new(Port::new_midi("m", PortDirection::Playback, 1, 9)),
        ];
        let mut tx = AmdtpTransmit::new(2);
        assert!(matches!(
            tx.prepare(&cfg, &ports),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn test_prepare_rejects_position_gap() {
        let cfg = test_cfg();
        let ports = vec![
            Arc::new(Port::new_audio("a", PortDirection::Playback, 0)),
            Arc::new(Port::new_audio("b", PortDirection::Playback, 2)),
        ];
        let mut tx = AmdtpTransmit::new(4);
        assert!(tx.prepare(&cfg, &ports).is_err());
    }

    #[test]
    fn test_prepare_rejects_unknown_rate() {
        let mut cfg = test_cfg();
        cfg.nominal_rate = 11_025;
        let mut tx = AmdtpTransmit::new(2);
        assert!(tx.prepare(&cfg, &[]).is_err());
    }

    #[test]
    fn test_disabled_port_encodes_silence() {
        let cfg = test_cfg();
        let ports = test_ports(&cfg);
        ports[1].set_enabled(false);
        for (i, p) in ports.iter().enumerate() {
            if i < 4 {
                p.with_buffer_mut(|b| b.fill(0x123456));
            }
        }
        let mut tx = AmdtpTransmit::new(5);
        tx.prepare(&cfg, &ports).unwrap();

        let mut data = vec![0u8; 16 * 5 * 4];
        assert!(tx.process_write_block(&mut data, 16, 0));

        // port 0 carries data, port 1 must be MBLA silence
        let q0 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(q0, 0x4012_3456);
        let q1 = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(q1, 0x4000_0000);
    }
}
