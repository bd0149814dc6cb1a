//! Repackages packets into fragmented MP4.
//!
//! Each sample is held back until the next packet of its track arrives, so
//! its duration is the distance between consecutive decode times. A fragment
//! is cut when a key frame arrives on the primary video track, which makes
//! every fragment start at a key frame.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    clock::{duration_to_ticks, ticks_to_duration},
    config::PackagerConfig,
    fmp4::{self, Sample, TrackRun, NON_SYNC_SAMPLE_FLAGS, SYNC_SAMPLE_FLAGS},
    packet::{CodecDescriptor, Packet},
};

/// 30 fps at 90 kHz.
const DEFAULT_VIDEO_DURATION: u32 = 3000;
/// One AAC frame.
const DEFAULT_AUDIO_DURATION: u32 = 1024;

/// `ftyp` + `moov`, emitted once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
    pub bytes: Bytes,
    /// e.g. `video/mp4; codecs="avc1.42c01e, mp4a.40.2"`
    pub mime: String,
}

/// One `moof` + `mdat` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Starts at 1.
    pub sequence: u32,
    pub bytes: Bytes,
    /// Decode time of the first sample of the primary track.
    pub decode_time: Duration,
    pub duration: Duration,
}

struct HeldSample {
    decode_ticks: u64,
    flags: u32,
    composition_offset: u32,
    payload: Bytes,
}

struct Track {
    timescale: u32,
    default_duration: u32,
    held: Option<HeldSample>,
    last_duration: Option<u32>,
    run: TrackRun,
}

impl Track {
    fn new(track_id: u32, codec: &CodecDescriptor) -> Self {
        Self {
            timescale: codec.timescale(),
            default_duration: if codec.is_video() {
                DEFAULT_VIDEO_DURATION
            } else {
                DEFAULT_AUDIO_DURATION
            },
            held: None,
            last_duration: None,
            run: TrackRun {
                track_id,
                ..Default::default()
            },
        }
    }

    /// Moves the held sample into the run, ending it at `next_ticks`.
    fn close_held(&mut self, next_ticks: Option<u64>) {
        let Some(held) = self.held.take() else {
            return;
        };
        let duration = match next_ticks {
            Some(next) => next.saturating_sub(held.decode_ticks).min(u32::MAX as u64) as u32,
            None => self.last_duration.unwrap_or(self.default_duration),
        };
        self.last_duration = Some(duration);

        if self.run.samples.is_empty() {
            self.run.base_decode_time = held.decode_ticks;
        }
        self.run.samples.push(Sample {
            duration,
            size: held.payload.len() as u32,
            flags: held.flags,
            composition_offset: held.composition_offset,
        });
        self.run.data.push(held.payload);
    }

    fn pending_duration(&self) -> Duration {
        let ticks = self.run.samples.iter().map(|s| s.duration as u64).sum();
        ticks_to_duration(ticks, self.timescale)
    }
}

pub struct FragmentPackager {
    tracks: Vec<Track>,
    /// First video track. Audio-only sessions have none.
    primary: Option<usize>,
    zero_composition: bool,
    fragment_duration: Duration,
    sequence: u32,
    started: bool,
}

impl FragmentPackager {
    /// `zero_composition` drops producer composition offsets, see
    /// [`CompositionCorrection`](crate::config::CompositionCorrection).
    pub fn new(
        codecs: &[CodecDescriptor],
        config: &PackagerConfig,
        zero_composition: bool,
    ) -> (Self, InitSegment) {
        let tracks = codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| Track::new(index as u32 + 1, codec))
            .collect();
        let packager = Self {
            tracks,
            primary: codecs.iter().position(CodecDescriptor::is_video),
            zero_composition,
            fragment_duration: config.fragment_duration(),
            sequence: 0,
            started: false,
        };

        let kind = if packager.primary.is_some() {
            "video/mp4"
        } else {
            "audio/mp4"
        };
        let codec_strings = codecs
            .iter()
            .map(CodecDescriptor::codec_string)
            .collect::<Vec<_>>()
            .join(", ");
        let init = InitSegment {
            bytes: fmp4::init_segment(codecs),
            mime: format!("{kind}; codecs=\"{codec_strings}\""),
        };
        (packager, init)
    }

    /// Number of fragments emitted so far.
    pub fn fragments(&self) -> u32 {
        self.sequence
    }

    pub fn write_packet(&mut self, packet: Packet) -> Option<Fragment> {
        let index = packet.stream_index;
        if index >= self.tracks.len() {
            log::debug!("Dropping packet of unknown stream {index}");
            return None;
        }
        let is_primary = self.primary == Some(index);

        if !self.started {
            match self.primary {
                Some(_) if is_primary && packet.is_key_frame => self.started = true,
                Some(_) => return None,
                None => self.started = true,
            }
        }

        let track = &mut self.tracks[index];
        let decode_ticks = duration_to_ticks(packet.decode_time, track.timescale);
        track.close_held(Some(decode_ticks));

        let cut = match self.primary {
            Some(_) => is_primary && packet.is_key_frame && !track.run.samples.is_empty(),
            None => track.pending_duration() >= self.fragment_duration,
        };
        let fragment = if cut { self.cut() } else { None };

        let track = &mut self.tracks[index];
        let composition_offset = if self.zero_composition {
            0
        } else {
            duration_to_ticks(packet.composition_offset(), track.timescale).min(u32::MAX as u64)
                as u32
        };
        let flags = if packet.is_key_frame || !is_primary {
            SYNC_SAMPLE_FLAGS
        } else {
            NON_SYNC_SAMPLE_FLAGS
        };
        track.held = Some(HeldSample {
            decode_ticks,
            flags,
            composition_offset,
            payload: packet.payload,
        });
        fragment
    }

    /// Emits everything still pending, including the held samples.
    pub fn flush(&mut self) -> Option<Fragment> {
        for track in &mut self.tracks {
            track.close_held(None);
        }
        self.cut()
    }

    fn cut(&mut self) -> Option<Fragment> {
        let runs = self
            .tracks
            .iter_mut()
            .map(|track| {
                std::mem::replace(
                    &mut track.run,
                    TrackRun {
                        track_id: track.run.track_id,
                        ..Default::default()
                    },
                )
            })
            .collect::<Vec<_>>();

        let (lead, timescale) = self
            .primary
            .into_iter()
            .chain(0..runs.len())
            .find(|&i| !runs[i].samples.is_empty())
            .map(|i| (&runs[i], self.tracks[i].timescale))?;

        let decode_time = ticks_to_duration(lead.base_decode_time, timescale);
        let duration = ticks_to_duration(
            lead.samples.iter().map(|s| s.duration as u64).sum(),
            timescale,
        );
        self.sequence += 1;
        Some(Fragment {
            sequence: self.sequence,
            bytes: fmp4::media_segment(self.sequence, &runs),
            decode_time,
            duration,
        })
    }
}
