use std::time::Duration;

use bytes::Bytes;

use super::{EsUnit, TrackKind};
use crate::{
    clock::TimeBase,
    codec::{aac::AacConfig, h264},
    error::{IngestError, IngestResult},
    packet::{AudioCodec, CodecDescriptor, Packet, VideoCodec},
};

/// When the assembler may declare the codec set complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every declared track must be described.
    Declared,
    /// Tracks appear with their sequence headers; ready once both kinds are
    /// described or the first coded frame arrives.
    FirstFrame,
}

#[derive(Debug)]
pub enum Assembled {
    Ready(Vec<CodecDescriptor>),
    Packet(Packet),
}

/// Parameter sets of one kind keyed by their id, first seen first.
type ParameterSets = Vec<(u32, Bytes)>;

/// Stores `set` under `id`. Once `locked`, only new ids may be added.
fn store_parameter_set(
    sets: &mut ParameterSets,
    id: u32,
    set: Bytes,
    locked: bool,
) -> IngestResult<()> {
    match sets.iter_mut().find(|(i, _)| *i == id) {
        Some((_, existing)) if *existing == set => {}
        Some(_) if locked => {
            return Err(IngestError::Stream(format!(
                "video parameter set {id} changed mid-stream"
            )))
        }
        Some((_, existing)) => *existing = set,
        None => sets.push((id, set)),
    }
    Ok(())
}

struct Track {
    id: u32,
    kind: TrackKind,
    sps: ParameterSets,
    pps: ParameterSets,
    audio_config: Option<Bytes>,
    stream_index: Option<usize>,
}

impl Track {
    fn new(id: u32, kind: TrackKind) -> Self {
        Self {
            id,
            kind,
            sps: Vec::new(),
            pps: Vec::new(),
            audio_config: None,
            stream_index: None,
        }
    }

    fn is_described(&self) -> bool {
        match self.kind {
            TrackKind::Video => !self.sps.is_empty() && !self.pps.is_empty(),
            TrackKind::Audio => self.audio_config.is_some(),
        }
    }
}

/// Gates elementary units until every codec is described, then emits
/// normalized packets.
pub struct TrackAssembler {
    readiness: Readiness,
    tracks: Vec<Track>,
    descriptors: Option<Vec<CodecDescriptor>>,
    time_base: TimeBase,
    saw_frame: bool,
    dropped: usize,
}

impl TrackAssembler {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            tracks: Vec::new(),
            descriptors: None,
            time_base: TimeBase::default(),
            saw_frame: false,
            dropped: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.descriptors.is_some()
    }

    pub fn descriptors(&self) -> Option<&[CodecDescriptor]> {
        self.descriptors.as_deref()
    }

    pub fn push(&mut self, unit: EsUnit, out: &mut Vec<Assembled>) -> IngestResult<()> {
        match unit {
            EsUnit::Declare { track, kind } => {
                if self.is_ready() {
                    log::warn!("Ignoring track {track} announced after negotiation");
                } else if self.track_mut(track).is_none() {
                    self.tracks.push(Track::new(track, kind));
                }
                Ok(())
            }
            EsUnit::VideoConfig { track, sps, pps } => {
                self.set_parameter_sets(track, vec![sps], vec![pps])?;
                self.try_ready(out)
            }
            EsUnit::AudioConfig { track, config } => {
                self.set_audio_config(track, config)?;
                self.try_ready(out)
            }
            EsUnit::Video {
                track,
                pts,
                dts,
                nalus,
            } => {
                let mut sps = Vec::new();
                let mut pps = Vec::new();
                let mut frames = Vec::with_capacity(nalus.len());
                for nal in nalus {
                    match h264::nal_type(&nal) {
                        h264::NAL_SPS => sps.push(nal),
                        h264::NAL_PPS => pps.push(nal),
                        kind if h264::is_frame_nal(kind) => frames.push(nal),
                        _ => {}
                    }
                }
                if !sps.is_empty() || !pps.is_empty() {
                    self.set_parameter_sets(track, sps, pps)?;
                }
                if frames.is_empty() {
                    return self.try_ready(out);
                }

                self.saw_frame = true;
                self.try_ready(out)?;
                let Some(stream_index) = self.stream_index(track) else {
                    self.dropped += 1;
                    return Ok(());
                };

                let is_key_frame = frames
                    .iter()
                    .any(|nal| h264::nal_type(nal) == h264::NAL_IDR);
                let payload = h264::length_prefix(&frames);
                out.push(Assembled::Packet(self.packet(
                    stream_index,
                    pts,
                    dts,
                    is_key_frame,
                    payload,
                )));
                Ok(())
            }
            EsUnit::Audio { track, pts, data } => {
                self.saw_frame = true;
                self.try_ready(out)?;
                let Some(stream_index) = self.stream_index(track) else {
                    self.dropped += 1;
                    return Ok(());
                };
                out.push(Assembled::Packet(
                    self.packet(stream_index, pts, pts, true, data),
                ));
                Ok(())
            }
        }
    }

    fn packet(
        &mut self,
        stream_index: usize,
        pts: Duration,
        dts: Duration,
        is_key_frame: bool,
        payload: Bytes,
    ) -> Packet {
        // the first emitted decode time is the shared origin
        let decode_time = self.time_base.rebase(dts);
        let presentation_time = self.time_base.rebase(pts).max(decode_time);
        Packet {
            stream_index,
            presentation_time,
            decode_time,
            is_key_frame,
            payload,
        }
    }

    fn track_mut(&mut self, id: u32) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Finds a track, registering it when tracks are discovered implicitly.
    fn track_for_config(&mut self, id: u32, kind: TrackKind) -> Option<&mut Track> {
        let exists = self.tracks.iter().any(|t| t.id == id);
        if !exists {
            if self.readiness == Readiness::Declared || self.is_ready() {
                return None;
            }
            self.tracks.push(Track::new(id, kind));
        }
        self.track_mut(id).filter(|t| t.kind == kind)
    }

    fn stream_index(&self, id: u32) -> Option<usize> {
        if !self.is_ready() {
            return None;
        }
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.stream_index)
    }

    fn set_parameter_sets(
        &mut self,
        id: u32,
        sps: Vec<Bytes>,
        pps: Vec<Bytes>,
    ) -> IngestResult<()> {
        let ready = self.is_ready();
        let Some(track) = self.track_for_config(id, TrackKind::Video) else {
            return Ok(());
        };

        if ready && track.stream_index.is_none() {
            return Ok(());
        }

        for sps in sps {
            let id = h264::sps_id(&sps).unwrap_or_default();
            store_parameter_set(&mut track.sps, id, sps, ready)?;
        }
        for pps in pps {
            let id = h264::pps_id(&pps).unwrap_or_default();
            store_parameter_set(&mut track.pps, id, pps, ready)?;
        }
        Ok(())
    }

    fn set_audio_config(&mut self, id: u32, config: Bytes) -> IngestResult<()> {
        let ready = self.is_ready();
        let Some(track) = self.track_for_config(id, TrackKind::Audio) else {
            return Ok(());
        };

        if ready {
            if track.stream_index.is_some() && track.audio_config.as_ref() != Some(&config) {
                return Err(IngestError::Stream(
                    "audio configuration changed mid-stream".into(),
                ));
            }
            return Ok(());
        }

        AacConfig::parse(&config)?;
        track.audio_config = Some(config);
        Ok(())
    }

    fn try_ready(&mut self, out: &mut Vec<Assembled>) -> IngestResult<()> {
        if self.is_ready() || self.tracks.is_empty() {
            return Ok(());
        }

        let ready = match self.readiness {
            Readiness::Declared => self.tracks.iter().all(Track::is_described),
            Readiness::FirstFrame => {
                let described = |kind| {
                    self.tracks
                        .iter()
                        .any(|t| t.kind == kind && t.is_described())
                };
                (described(TrackKind::Video) && described(TrackKind::Audio))
                    || (self.saw_frame && self.tracks.iter().any(Track::is_described))
            }
        };
        if !ready {
            return Ok(());
        }

        let mut descriptors = Vec::new();
        for track in self.tracks.iter_mut().filter(|t| t.is_described()) {
            let descriptor = match track.kind {
                TrackKind::Video => {
                    let (Some((_, sps)), Some((_, pps))) =
                        (track.sps.first().cloned(), track.pps.first().cloned())
                    else {
                        continue;
                    };
                    let (width, height) = h264::sps_dimensions(&sps).unwrap_or_else(|| {
                        log::warn!("Failed to read picture size from SPS");
                        (0, 0)
                    });
                    CodecDescriptor::Video(VideoCodec::H264 {
                        sps,
                        pps,
                        width,
                        height,
                    })
                }
                TrackKind::Audio => {
                    let Some(config) = track.audio_config.clone() else {
                        continue;
                    };
                    let parsed = AacConfig::parse(&config)?;
                    CodecDescriptor::Audio(AudioCodec::Aac {
                        sample_rate: parsed.sample_rate(),
                        channels: parsed.channels,
                        config,
                    })
                }
            };
            track.stream_index = Some(descriptors.len());
            descriptors.push(descriptor);
        }

        if self.dropped > 0 {
            log::debug!("Dropped {} frames before codec parameters", self.dropped);
        }
        log::info!("Codec parameters ready: {} stream(s)", descriptors.len());
        out.push(Assembled::Ready(descriptors.clone()));
        self.descriptors = Some(descriptors);
        Ok(())
    }
}
