use std::time::Duration;

use bytes::Bytes;

/// One elementary-stream access unit.
///
/// Video payloads are one or more NAL units, each prefixed by its 4-byte
/// big-endian length. Audio payloads are raw AAC access units without ADTS
/// headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    pub presentation_time: Duration,
    pub decode_time: Duration,
    pub is_key_frame: bool,
    pub payload: Bytes,
}

impl Packet {
    /// Presentation minus decode time, saturating at zero.
    pub fn composition_offset(&self) -> Duration {
        self.presentation_time.saturating_sub(self.decode_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCodec {
    H264 {
        sps: Bytes,
        pps: Bytes,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    Aac {
        /// AudioSpecificConfig
        config: Bytes,
        sample_rate: u32,
        channels: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecDescriptor {
    Video(VideoCodec),
    Audio(AudioCodec),
}

impl CodecDescriptor {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecDescriptor::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, CodecDescriptor::Audio(_))
    }

    /// RFC 6381 codec string, as used in a MIME `codecs` parameter.
    pub fn codec_string(&self) -> String {
        match self {
            CodecDescriptor::Video(VideoCodec::H264 { sps, .. }) => match sps.get(1..4) {
                Some(p) => format!("avc1.{:02x}{:02x}{:02x}", p[0], p[1], p[2]),
                None => "avc1".to_string(),
            },
            CodecDescriptor::Audio(AudioCodec::Aac { config, .. }) => {
                let object_type = config.first().map(|b| b >> 3).unwrap_or(2);
                format!("mp4a.40.{object_type}")
            }
        }
    }

    /// Native timescale used when packaging this stream.
    pub fn timescale(&self) -> u32 {
        match self {
            CodecDescriptor::Video(_) => 90_000,
            CodecDescriptor::Audio(AudioCodec::Aac { sample_rate, .. }) => *sample_rate,
        }
    }
}
