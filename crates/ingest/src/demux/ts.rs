//! MPEG transport stream demultiplexer.
//!
//! Packet framing, PAT/PMT tracking and PES headers come from `mpeg2ts`; this
//! module turns finished PES payloads into [`EsUnit`]s.

use std::{
    collections::HashMap,
    io::{self, Read},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Buf, BytesMut};
use mpeg2ts::{
    es::StreamType,
    time::Timestamp,
    ts::{ReadTsPacket, TsPacket, TsPacketReader, TsPayload},
};

use super::{EsUnit, TrackKind};
use crate::{
    clock::{ticks_to_duration, TimestampUnwrapper, MPEG_CLOCK_RATE},
    codec::{
        aac::{self, AacConfig},
        h264,
    },
    error::{IngestError, IngestResult},
};

pub const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Stream types that carry audio or video this crate cannot handle.
fn unsupported_codec(stream_type: u8) -> Option<&'static str> {
    match stream_type {
        0x01 | 0x02 => Some("MPEG-1/2 video"),
        0x03 | 0x04 => Some("MPEG audio"),
        0x10 => Some("MPEG-4 part 2 video"),
        0x11 => Some("AAC LATM"),
        0x24 => Some("H.265"),
        0x81 | 0x87 => Some("AC-3"),
        _ => None,
    }
}

/// Bytes received so far, shared between the demuxer and the packet reader.
#[derive(Clone, Default)]
struct Feed(Arc<Mutex<BytesMut>>);

impl Feed {
    fn buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for Feed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut data = self.buffer();
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        data.advance(n);
        Ok(n)
    }
}

struct PesStream {
    kind: TrackKind,
    buffer: BytesMut,
    pts: Option<u64>,
    dts: Option<u64>,
    unwrapper: TimestampUnwrapper,
    audio_config: Option<AacConfig>,
}

impl PesStream {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            buffer: BytesMut::new(),
            pts: None,
            dts: None,
            unwrapper: TimestampUnwrapper::new(33),
            audio_config: None,
        }
    }
}

pub struct TsDemuxer {
    feed: Feed,
    reader: TsPacketReader<Feed>,
    program_seen: bool,
    streams: HashMap<u16, PesStream>,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        let feed = Feed::default();
        Self {
            reader: TsPacketReader::new(feed.clone()),
            feed,
            program_seen: false,
            streams: HashMap::new(),
        }
    }

    fn buffered(&self) -> usize {
        self.feed.buffer().len()
    }

    /// Drops bytes up to the next sync byte. Returns whether a whole packet
    /// is buffered afterwards.
    fn resync(&self) -> bool {
        let mut buffer = self.feed.buffer();
        if buffer.first() != Some(&SYNC_BYTE) {
            let skip = memchr::memchr(SYNC_BYTE, &buffer).unwrap_or(buffer.len());
            log::debug!("Skipping {skip} bytes to resync transport stream");
            buffer.advance(skip);
        }
        buffer.len() >= PACKET_SIZE
    }

    pub fn push(&mut self, data: &[u8], out: &mut Vec<EsUnit>) -> IngestResult<()> {
        self.feed.buffer().extend_from_slice(data);

        while self.resync() {
            let before = self.buffered();
            match self.reader.read_ts_packet() {
                Ok(Some(packet)) => self.packet(packet, out)?,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Skipping malformed transport stream packet: {e}");
                    if self.buffered() == before {
                        self.feed.buffer().advance(1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Emits every PES that is still being assembled.
    pub fn flush(&mut self, out: &mut Vec<EsUnit>) {
        let mut pids: Vec<u16> = self.streams.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if let Some(stream) = self.streams.get_mut(&pid) {
                Self::emit(pid, stream, out);
            }
        }
    }

    fn packet(&mut self, packet: TsPacket, out: &mut Vec<EsUnit>) -> IngestResult<()> {
        let pid = packet.header.pid.as_u16();
        match packet.payload {
            Some(TsPayload::Pmt(pmt)) if !self.program_seen => {
                for es in &pmt.es_info {
                    let es_pid = es.elementary_pid.as_u16();
                    let kind = match es.stream_type {
                        StreamType::H264 => TrackKind::Video,
                        StreamType::AdtsAac => TrackKind::Audio,
                        other => {
                            let code = other as u8;
                            if let Some(name) = unsupported_codec(code) {
                                return Err(IngestError::Negotiation(format!(
                                    "unsupported codec: {name} (stream type {code:#04x})"
                                )));
                            }
                            log::debug!("Ignoring PID {es_pid} with stream type {other:?}");
                            continue;
                        }
                    };
                    self.streams.insert(es_pid, PesStream::new(kind));
                    out.push(EsUnit::Declare {
                        track: es_pid as u32,
                        kind,
                    });
                }
                self.program_seen = true;
            }
            Some(TsPayload::Pes(pes)) => {
                let Some(stream) = self.streams.get_mut(&pid) else {
                    return Ok(());
                };
                Self::emit(pid, stream, out);

                let Some(pts) = pes.header.pts.as_ref().map(Timestamp::as_u64) else {
                    log::debug!("Dropping PES without timestamps on PID {pid}");
                    return Ok(());
                };
                let dts = pes.header.dts.as_ref().map_or(pts, Timestamp::as_u64);
                stream.pts = Some(stream.unwrapper.unwrap(pts));
                stream.dts = Some(stream.unwrapper.unwrap(dts));
                stream.buffer.extend_from_slice(&pes.data);
            }
            Some(TsPayload::Raw(data)) => {
                if let Some(stream) = self.streams.get_mut(&pid) {
                    if stream.pts.is_some() {
                        stream.buffer.extend_from_slice(&data);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn emit(pid: u16, stream: &mut PesStream, out: &mut Vec<EsUnit>) {
        let (Some(pts), Some(dts)) = (stream.pts.take(), stream.dts.take()) else {
            stream.buffer.clear();
            return;
        };
        let data = stream.buffer.split().freeze();
        if data.is_empty() {
            return;
        }
        let track = pid as u32;
        let pts = ticks_to_duration(pts, MPEG_CLOCK_RATE);
        let dts = ticks_to_duration(dts, MPEG_CLOCK_RATE);

        match stream.kind {
            TrackKind::Video => out.push(EsUnit::Video {
                track,
                pts,
                dts,
                nalus: h264::split_annexb(&data),
            }),
            TrackKind::Audio => {
                let frames = match aac::split_adts(&data) {
                    Ok((frames, used)) => {
                        if used < data.len() {
                            log::debug!("Discarding {} bytes of partial ADTS frame", data.len() - used);
                        }
                        frames
                    }
                    Err(e) => {
                        log::warn!("Invalid ADTS payload on PID {pid}: {e}");
                        return;
                    }
                };

                for (i, frame) in frames.into_iter().enumerate() {
                    if stream.audio_config != Some(frame.config) {
                        stream.audio_config = Some(frame.config);
                        out.push(EsUnit::AudioConfig {
                            track,
                            config: frame.config.to_bytes(),
                        });
                    }
                    let offset = ticks_to_duration(
                        i as u64 * aac::SAMPLES_PER_FRAME,
                        frame.config.sample_rate(),
                    );
                    out.push(EsUnit::Audio {
                        track,
                        pts: pts + offset,
                        data: frame.data,
                    });
                }
            }
        }
    }
}
