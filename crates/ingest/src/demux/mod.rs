//! Container demultiplexers and the elementary-stream assembler they feed.
//!
//! Demuxers turn container bytes into [`EsUnit`]s: per-track parameter sets
//! and raw access units with wire timestamps already converted to
//! [`Duration`]. The [`TrackAssembler`] gates those units until every codec is
//! described, then turns them into [`Packet`](crate::packet::Packet)s.

mod assembler;
pub mod flv;
pub mod mp4;
pub mod ts;

use std::{path::Path, time::Duration};

use bytes::Bytes;

pub use assembler::{Assembled, Readiness, TrackAssembler};

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsUnit {
    /// A track the container announced up front.
    Declare { track: u32, kind: TrackKind },
    /// Out-of-band H.264 parameter sets.
    VideoConfig { track: u32, sps: Bytes, pps: Bytes },
    /// AAC AudioSpecificConfig.
    AudioConfig { track: u32, config: Bytes },
    /// One video access unit as bare NAL units (in-band SPS/PPS allowed).
    Video {
        track: u32,
        pts: Duration,
        dts: Duration,
        nalus: Vec<Bytes>,
    },
    /// One raw AAC access unit.
    Audio {
        track: u32,
        pts: Duration,
        data: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Flv,
    Ts,
    Mp4,
    /// CMAF segments behind an `EXT-X-MAP` initialization section.
    Fmp4,
}

impl ContainerFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "flv" => Some(Self::Flv),
            "ts" => Some(Self::Ts),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> IngestResult<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| {
                IngestError::Dial(format!("unsupported container: {}", path.display()))
            })
    }

    pub fn from_url(url: &url::Url) -> IngestResult<Self> {
        Self::from_path(Path::new(url.path()))
    }

    /// Whether samples are read through a seekable [`mp4::Mp4Demuxer`]
    /// instead of a byte-fed [`Demuxer`].
    pub fn needs_random_access(&self) -> bool {
        matches!(self, Self::Mp4)
    }
}

/// Demuxers fed with bytes as they arrive.
pub enum Demuxer {
    Flv(flv::FlvDemuxer),
    Ts(ts::TsDemuxer),
    /// Every push is one whole object, the initialization section first.
    Fmp4(mp4::Fmp4Demuxer),
}

impl Demuxer {
    pub fn new(format: ContainerFormat) -> IngestResult<Self> {
        match format {
            ContainerFormat::Flv => Ok(Self::Flv(flv::FlvDemuxer::new())),
            ContainerFormat::Ts => Ok(Self::Ts(ts::TsDemuxer::new())),
            ContainerFormat::Fmp4 => Ok(Self::Fmp4(mp4::Fmp4Demuxer::new())),
            ContainerFormat::Mp4 => Err(IngestError::Negotiation(
                "progressive mp4 needs a seekable source".into(),
            )),
        }
    }

    /// FLV announces tracks only through their sequence headers.
    pub fn readiness(&self) -> Readiness {
        match self {
            Self::Flv(_) => Readiness::FirstFrame,
            Self::Ts(_) | Self::Fmp4(_) => Readiness::Declared,
        }
    }

    pub fn push(&mut self, data: &[u8], out: &mut Vec<EsUnit>) -> IngestResult<()> {
        match self {
            Self::Flv(d) => d.push(data, out),
            Self::Ts(d) => d.push(data, out),
            Self::Fmp4(d) => d.push(data, out),
        }
    }

    /// Called once the input is exhausted.
    pub fn finish(&mut self, out: &mut Vec<EsUnit>) -> IngestResult<()> {
        match self {
            Self::Flv(d) => d.finish(),
            Self::Ts(d) => {
                d.flush(out);
                Ok(())
            }
            Self::Fmp4(_) => Ok(()),
        }
    }
}
