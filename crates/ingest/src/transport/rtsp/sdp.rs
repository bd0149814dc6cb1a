//! The parts of an SDP session description needed to set up RTP tracks.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;

use crate::{
    codec::h264::{self, NAL_PPS, NAL_SPS},
    error::{IngestError, IngestResult},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    /// `video`, `audio`, ...
    pub media: String,
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap`, upper-cased.
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// `a=fmtp` parameters with lower-cased keys.
    pub fmtp: HashMap<String, String>,
    pub control: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub control: Option<String>,
    pub media: Vec<MediaDescription>,
}

/// Codec parameters of a track this client can depacketize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackCodec {
    H264 {
        sps: Option<Bytes>,
        pps: Option<Bytes>,
    },
    /// RFC 3640 `AAC-hbr`.
    Aac {
        config: Bytes,
        size_length: u32,
        index_length: u32,
        index_delta_length: u32,
    },
}

pub fn parse(text: &str) -> IngestResult<SessionDescription> {
    let mut session = SessionDescription::default();
    for line in text.lines() {
        let line = line.trim();
        let Some((kind, value)) = line.split_once('=') else {
            continue;
        };
        match kind {
            "m" => {
                let mut fields = value.split_whitespace();
                let media = fields.next().unwrap_or_default().to_string();
                let payload_type = fields
                    .nth(2)
                    .and_then(|pt| pt.parse().ok())
                    .ok_or_else(|| IngestError::Dial(format!("invalid SDP media line: {line}")))?;
                session.media.push(MediaDescription {
                    media,
                    payload_type,
                    ..Default::default()
                });
            }
            "a" => {
                let (name, attr) = value.split_once(':').unwrap_or((value, ""));
                match (name, session.media.last_mut()) {
                    ("control", None) => session.control = Some(attr.to_string()),
                    ("control", Some(media)) => media.control = Some(attr.to_string()),
                    ("rtpmap", Some(media)) => parse_rtpmap(media, attr),
                    ("fmtp", Some(media)) => parse_fmtp(media, attr),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(session)
}

fn parse_rtpmap(media: &mut MediaDescription, attr: &str) {
    let Some((pt, encoding)) = attr.split_once(' ') else {
        return;
    };
    if pt.parse::<u8>().ok() != Some(media.payload_type) {
        return;
    }
    let mut parts = encoding.trim().split('/');
    media.encoding = parts.next().unwrap_or_default().to_ascii_uppercase();
    media.clock_rate = parts.next().and_then(|r| r.parse().ok()).unwrap_or(0);
    media.channels = parts.next().and_then(|c| c.parse().ok());
}

fn parse_fmtp(media: &mut MediaDescription, attr: &str) {
    let Some((pt, params)) = attr.split_once(' ') else {
        return;
    };
    if pt.parse::<u8>().ok() != Some(media.payload_type) {
        return;
    }
    for param in params.split(';') {
        if let Some((key, value)) = param.trim().split_once('=') {
            media
                .fmtp
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
}

impl MediaDescription {
    fn fmtp_u32(&self, key: &str, default: u32) -> u32 {
        self.fmtp
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// `Ok(None)` for tracks that are skipped.
    pub fn codec(&self) -> IngestResult<Option<TrackCodec>> {
        match (self.media.as_str(), self.encoding.as_str()) {
            ("video", "H264") => {
                let mut sps = None;
                let mut pps = None;
                if let Some(sets) = self.fmtp.get("sprop-parameter-sets") {
                    for set in sets.split(',').filter(|s| !s.is_empty()) {
                        let nal = STANDARD.decode(set).map_err(|e| {
                            IngestError::Negotiation(format!("invalid sprop-parameter-sets: {e}"))
                        })?;
                        match h264::nal_type(&nal) {
                            NAL_SPS => sps = Some(Bytes::from(nal)),
                            NAL_PPS => pps = Some(Bytes::from(nal)),
                            _ => {}
                        }
                    }
                }
                Ok(Some(TrackCodec::H264 { sps, pps }))
            }
            ("audio", "MPEG4-GENERIC") => {
                let mode = self.fmtp.get("mode").map(|m| m.to_ascii_lowercase());
                if mode.as_deref() != Some("aac-hbr") {
                    log::warn!("Skipping MPEG4-GENERIC track in mode {mode:?}");
                    return Ok(None);
                }
                let config = self
                    .fmtp
                    .get("config")
                    .ok_or_else(|| IngestError::Negotiation("AAC track without config".into()))?;
                let config = hex::decode(config).map_err(|e| {
                    IngestError::Negotiation(format!("invalid AAC config {config}: {e}"))
                })?;
                Ok(Some(TrackCodec::Aac {
                    config: Bytes::from(config),
                    size_length: self.fmtp_u32("sizelength", 13),
                    index_length: self.fmtp_u32("indexlength", 3),
                    index_delta_length: self.fmtp_u32("indexdeltalength", 3),
                }))
            }
            (media, encoding) => {
                log::warn!("Skipping unsupported {media} track {encoding}");
                Ok(None)
            }
        }
    }
}

/// Resolves a track's `a=control` against the session base URL.
pub fn control_url(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("*") | Some("") => base.to_string(),
        Some(control) if control.starts_with("rtsp://") || control.starts_with("rtsps://") => {
            control.to_string()
        }
        Some(control) => {
            if base.ends_with('/') {
                format!("{base}{control}")
            } else {
                format!("{base}/{control}")
            }
        }
    }
}
