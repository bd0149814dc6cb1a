use bytes::Bytes;

use crate::error::{IngestError, IngestResult};

/// Samples per AAC access unit.
pub const SAMPLES_PER_FRAME: u64 = 1024;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// The fields of an AudioSpecificConfig this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
}

impl AacConfig {
    pub fn parse(config: &[u8]) -> IngestResult<Self> {
        if config.len() < 2 {
            return Err(IngestError::Negotiation(
                "AudioSpecificConfig too short".into(),
            ));
        }
        let object_type = config[0] >> 3;
        let sample_rate_index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
        let channels = (config[1] >> 3) & 0x0f;
        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(IngestError::Negotiation(format!(
                "unsupported AAC sampling frequency index {sample_rate_index}"
            )));
        }
        Ok(Self {
            object_type,
            sample_rate_index,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES
            .get(self.sample_rate_index as usize)
            .copied()
            .unwrap_or(44100)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(vec![
            (self.object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 1) << 7) | (self.channels << 3),
        ])
    }
}

pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|r| *r == rate).map(|i| i as u8)
}

/// One ADTS frame: its configuration and the raw access unit.
pub struct AdtsFrame {
    pub config: AacConfig,
    pub data: Bytes,
}

/// Splits a buffer of back-to-back ADTS frames.
///
/// A trailing partial frame is left unconsumed; the returned length says how
/// many bytes were used.
pub fn split_adts(data: &Bytes) -> IngestResult<(Vec<AdtsFrame>, usize)> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 7 <= data.len() {
        let header = &data[pos..];
        if header[0] != 0xff || header[1] & 0xf0 != 0xf0 {
            return Err(IngestError::Stream("lost ADTS sync".into()));
        }

        let has_crc = header[1] & 0x01 == 0;
        let header_len = if has_crc { 9 } else { 7 };
        let frame_len = (((header[3] & 0x03) as usize) << 11)
            | ((header[4] as usize) << 3)
            | ((header[5] as usize) >> 5);
        if frame_len < header_len {
            return Err(IngestError::Stream("invalid ADTS frame length".into()));
        }
        if pos + frame_len > data.len() {
            break;
        }

        let config = AacConfig {
            // ADTS carries profile, which is object type minus one
            object_type: ((header[2] >> 6) & 0x03) + 1,
            sample_rate_index: (header[2] >> 2) & 0x0f,
            channels: ((header[2] & 0x01) << 2) | (header[3] >> 6),
        };
        if config.sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(IngestError::Stream(
                "invalid ADTS sampling frequency index".into(),
            ));
        }

        frames.push(AdtsFrame {
            config,
            data: data.slice(pos + header_len..pos + frame_len),
        });
        pos += frame_len;
    }
    Ok((frames, pos))
}
