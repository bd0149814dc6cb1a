//! FLV file framing and the audio/video tag bodies shared with RTMP.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

use super::EsUnit;
use crate::{
    codec::h264::{self, AvcConfig},
    error::{IngestError, IngestResult},
};

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;

pub const VIDEO_TRACK: u32 = 0;
pub const AUDIO_TRACK: u32 = 1;

const CODEC_AVC: u8 = 7;
const SOUND_FORMAT_AAC: u8 = 10;

/// Turns FLV/RTMP audio and video message bodies into elementary units.
pub struct FlvTagParser {
    nal_length_size: usize,
}

impl Default for FlvTagParser {
    fn default() -> Self {
        Self { nal_length_size: 4 }
    }
}

impl FlvTagParser {
    pub fn video(
        &mut self,
        timestamp: Duration,
        body: Bytes,
        out: &mut Vec<EsUnit>,
    ) -> IngestResult<()> {
        if body.len() < 5 {
            return Ok(());
        }
        if body[0] & 0x80 != 0 {
            return Err(IngestError::Negotiation(
                "unsupported codec: enhanced FLV video".into(),
            ));
        }
        let codec = body[0] & 0x0f;
        if codec != CODEC_AVC {
            return Err(IngestError::Negotiation(format!(
                "unsupported codec: FLV video codec id {codec}"
            )));
        }

        match body[1] {
            0 => {
                let config = AvcConfig::parse(&body.slice(5..))?;
                self.nal_length_size = config.length_size;
                out.push(EsUnit::VideoConfig {
                    track: VIDEO_TRACK,
                    sps: config.sps,
                    pps: config.pps,
                });
            }
            1 => {
                // composition time is a signed 24-bit value
                let raw = ((body[2] as i32) << 16) | ((body[3] as i32) << 8) | body[4] as i32;
                let cts = (raw << 8) >> 8;
                let pts = if cts >= 0 {
                    timestamp + Duration::from_millis(cts as u64)
                } else {
                    timestamp.saturating_sub(Duration::from_millis(cts.unsigned_abs() as u64))
                };
                let nalus = h264::split_length_prefixed(&body.slice(5..), self.nal_length_size)?;
                out.push(EsUnit::Video {
                    track: VIDEO_TRACK,
                    pts,
                    dts: timestamp,
                    nalus,
                });
            }
            _ => {}
        }
        Ok(())
    }

    pub fn audio(
        &mut self,
        timestamp: Duration,
        body: Bytes,
        out: &mut Vec<EsUnit>,
    ) -> IngestResult<()> {
        if body.len() < 2 {
            return Ok(());
        }
        let format = body[0] >> 4;
        if format != SOUND_FORMAT_AAC {
            return Err(IngestError::Negotiation(format!(
                "unsupported codec: FLV sound format {format}"
            )));
        }

        match body[1] {
            0 => out.push(EsUnit::AudioConfig {
                track: AUDIO_TRACK,
                config: body.slice(2..),
            }),
            _ => out.push(EsUnit::Audio {
                track: AUDIO_TRACK,
                pts: timestamp,
                data: body.slice(2..),
            }),
        }
        Ok(())
    }
}

enum State {
    Header,
    Tags,
}

pub struct FlvDemuxer {
    buffer: BytesMut,
    state: State,
    tags: FlvTagParser,
}

impl Default for FlvDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvDemuxer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::Header,
            tags: FlvTagParser::default(),
        }
    }

    pub fn push(&mut self, data: &[u8], out: &mut Vec<EsUnit>) -> IngestResult<()> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::Header => {
                    if self.buffer.len() < 9 {
                        return Ok(());
                    }
                    if &self.buffer[..3] != b"FLV" {
                        return Err(IngestError::Negotiation("not an FLV file".into()));
                    }
                    let offset = u32::from_be_bytes([
                        self.buffer[5],
                        self.buffer[6],
                        self.buffer[7],
                        self.buffer[8],
                    ]) as usize;
                    // header plus PreviousTagSize0
                    if self.buffer.len() < offset + 4 {
                        return Ok(());
                    }
                    self.buffer.advance(offset + 4);
                    self.state = State::Tags;
                }
                State::Tags => {
                    if self.buffer.len() < 11 {
                        return Ok(());
                    }
                    let tag_type = self.buffer[0] & 0x1f;
                    let size = ((self.buffer[1] as usize) << 16)
                        | ((self.buffer[2] as usize) << 8)
                        | self.buffer[3] as usize;
                    let timestamp = ((self.buffer[7] as u32) << 24)
                        | ((self.buffer[4] as u32) << 16)
                        | ((self.buffer[5] as u32) << 8)
                        | self.buffer[6] as u32;
                    if self.buffer.len() < 11 + size + 4 {
                        return Ok(());
                    }

                    self.buffer.advance(11);
                    let body = self.buffer.split_to(size).freeze();
                    self.buffer.advance(4);

                    let timestamp = Duration::from_millis(timestamp as u64);
                    match tag_type {
                        TAG_VIDEO => self.tags.video(timestamp, body, out)?,
                        TAG_AUDIO => self.tags.audio(timestamp, body, out)?,
                        _ => {}
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> IngestResult<()> {
        if !self.buffer.is_empty() {
            log::debug!("FLV ended with {} bytes of partial tag", self.buffer.len());
        }
        Ok(())
    }
}
