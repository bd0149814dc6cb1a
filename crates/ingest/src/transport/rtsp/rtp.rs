//! RTP packet parsing and depacketization (RFC 3550, RFC 6184, RFC 3640).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    codec::h264,
    error::{IngestError, IngestResult},
};

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(mut data: Bytes) -> IngestResult<Self> {
        if data.len() < 12 || data[0] >> 6 != 2 {
            return Err(IngestError::Stream("invalid RTP packet".into()));
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let mut header = 12 + csrc_count * 4;
        if extension {
            if data.len() < header + 4 {
                return Err(IngestError::Stream("truncated RTP extension".into()));
            }
            let words = u16::from_be_bytes([data[header + 2], data[header + 3]]) as usize;
            header += 4 + words * 4;
        }
        let mut end = data.len();
        if padding {
            end = end.saturating_sub(data[data.len() - 1] as usize);
        }
        if header > end {
            return Err(IngestError::Stream("truncated RTP packet".into()));
        }
        data.truncate(end);
        data.advance(header);

        Ok(Self {
            payload_type,
            marker,
            sequence,
            timestamp,
            payload: data,
        })
    }
}

/// Collects the NAL units of one access unit (RFC 6184 single NAL, STAP-A
/// and FU-A packetization).
#[derive(Default)]
pub struct H264Depacketizer {
    timestamp: Option<u32>,
    nalus: Vec<Bytes>,
    fragment: Option<BytesMut>,
    last_sequence: Option<u16>,
}

impl H264Depacketizer {
    /// Returns a finished access unit with its RTP timestamp.
    pub fn push(&mut self, packet: RtpPacket) -> Option<(u32, Vec<Bytes>)> {
        let mut finished = None;
        if self.timestamp.is_some_and(|t| t != packet.timestamp) {
            finished = self.take();
        }
        if let Some(last) = self.last_sequence {
            if packet.sequence != last.wrapping_add(1) && self.fragment.take().is_some() {
                log::debug!("RTP packet loss inside a fragmented NAL unit, dropping it");
            }
        }
        self.last_sequence = Some(packet.sequence);
        self.timestamp = Some(packet.timestamp);

        let mut payload = packet.payload;
        if payload.is_empty() {
            return finished;
        }
        match h264::nal_type(&payload) {
            1..=23 => self.nalus.push(payload),
            STAP_A => {
                payload.advance(1);
                while payload.len() >= 2 {
                    let size = payload.get_u16() as usize;
                    if size > payload.len() {
                        break;
                    }
                    self.nalus.push(payload.split_to(size));
                }
            }
            FU_A if payload.len() >= 2 => {
                let indicator = payload[0];
                let header = payload[1];
                let start = header & 0x80 != 0;
                let end = header & 0x40 != 0;
                if start {
                    let mut nal = BytesMut::with_capacity(payload.len() * 4);
                    nal.put_u8((indicator & 0xe0) | (header & 0x1f));
                    nal.put_slice(&payload[2..]);
                    self.fragment = Some(nal);
                } else if let Some(nal) = &mut self.fragment {
                    nal.put_slice(&payload[2..]);
                }
                if end {
                    if let Some(nal) = self.fragment.take() {
                        self.nalus.push(nal.freeze());
                    }
                }
            }
            kind => log::debug!("Ignoring RTP H.264 payload type {kind}"),
        }

        if packet.marker && finished.is_none() {
            finished = self.take();
        }
        finished
    }

    fn take(&mut self) -> Option<(u32, Vec<Bytes>)> {
        let timestamp = self.timestamp.take()?;
        if self.nalus.is_empty() {
            return None;
        }
        Some((timestamp, std::mem::take(&mut self.nalus)))
    }
}

/// Splits RFC 3640 `AAC-hbr` payloads into access units.
pub struct AacDepacketizer {
    size_length: u32,
    index_length: u32,
    index_delta_length: u32,
}

impl AacDepacketizer {
    pub fn new(size_length: u32, index_length: u32, index_delta_length: u32) -> Self {
        Self {
            size_length,
            index_length,
            index_delta_length,
        }
    }

    pub fn push(&self, mut payload: Bytes) -> IngestResult<Vec<Bytes>> {
        if payload.len() < 2 {
            return Err(IngestError::Stream("truncated AU header section".into()));
        }
        let header_bits = payload.get_u16() as usize;
        let header_bytes = header_bits.div_ceil(8);
        if payload.len() < header_bytes {
            return Err(IngestError::Stream("truncated AU header section".into()));
        }
        let headers = payload.split_to(header_bytes);

        let mut reader = BitCursor::new(&headers);
        let mut sizes = Vec::new();
        let mut consumed = 0;
        while consumed < header_bits {
            let index_bits = if sizes.is_empty() {
                self.index_length
            } else {
                self.index_delta_length
            };
            let bits = (self.size_length + index_bits) as usize;
            if bits == 0 || consumed + bits > header_bits {
                break;
            }
            sizes.push(reader.read(self.size_length) as usize);
            reader.read(index_bits);
            consumed += bits;
        }

        let mut units = Vec::with_capacity(sizes.len());
        for size in sizes {
            if size > payload.len() {
                return Err(IngestError::Stream("truncated AAC access unit".into()));
            }
            units.push(payload.split_to(size));
        }
        Ok(units)
    }
}

struct BitCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn read(&mut self, bits: u32) -> u32 {
        let mut value = 0;
        for _ in 0..bits {
            let byte = self.data.get(self.position / 8).copied().unwrap_or(0);
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.position += 1;
        }
        value
    }
}
