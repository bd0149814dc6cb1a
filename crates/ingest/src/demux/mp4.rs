//! MP4 demuxing on top of the `mp4` crate.
//!
//! [`Mp4Demuxer`] reads samples on demand from any seekable source: a local
//! file, a buffered HTTP body, or one CMAF media segment paired with the
//! `moov` of its initialization section ([`Fmp4Demuxer`]).

use std::io::{Cursor, Read, Seek};

use bytes::Bytes;
use mp4::{MediaType, Mp4Reader, Mp4Sample, TrackType};

use super::{EsUnit, TrackKind};
use crate::{
    clock::ticks_to_duration,
    codec::{aac::AacConfig, h264},
    error::{IngestError, IngestResult},
};

/// Sample entries carry NAL units with a 4 byte length prefix.
const NAL_LENGTH_SIZE: usize = 4;

fn negotiation(e: mp4::Error) -> IngestError {
    IngestError::Negotiation(format!("invalid mp4: {e}"))
}

struct SampleCursor {
    track_id: u32,
    kind: TrackKind,
    timescale: u32,
    next: u32,
    count: u32,
    peeked: Option<Mp4Sample>,
}

pub struct Mp4Demuxer<R> {
    reader: Mp4Reader<R>,
    tracks: Vec<SampleCursor>,
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    /// Reads the `moov` box of a progressive file.
    pub fn open(reader: R, size: u64) -> IngestResult<Self> {
        let reader = Mp4Reader::read_header(reader, size).map_err(negotiation)?;
        Self::with_reader(reader)
    }

    fn with_reader(reader: Mp4Reader<R>) -> IngestResult<Self> {
        let mut tracks = Vec::new();
        for track in reader.tracks().values() {
            let kind = match track.track_type().map_err(negotiation)? {
                TrackType::Video => TrackKind::Video,
                TrackType::Audio => TrackKind::Audio,
                other => {
                    log::debug!("Ignoring {other:?} track {}", track.track_id());
                    continue;
                }
            };
            match (kind, track.media_type().map_err(negotiation)?) {
                (TrackKind::Video, MediaType::H264) | (TrackKind::Audio, MediaType::AAC) => {}
                (_, other) => {
                    return Err(IngestError::Negotiation(format!("unsupported codec: {other:?}")))
                }
            }
            tracks.push(SampleCursor {
                track_id: track.track_id(),
                kind,
                timescale: track.timescale(),
                next: 1,
                count: track.sample_count(),
                peeked: None,
            });
        }
        if tracks.is_empty() {
            return Err(IngestError::Negotiation(
                "mp4 has no H.264 or AAC track".into(),
            ));
        }
        tracks.sort_by_key(|t| t.track_id);
        Ok(Self { reader, tracks })
    }

    /// Declares every track and its out-of-band codec configuration.
    pub fn describe(&self, out: &mut Vec<EsUnit>) -> IngestResult<()> {
        for cursor in &self.tracks {
            out.push(EsUnit::Declare {
                track: cursor.track_id,
                kind: cursor.kind,
            });
        }
        for cursor in &self.tracks {
            let Some(track) = self.reader.tracks().get(&cursor.track_id) else {
                continue;
            };
            match cursor.kind {
                TrackKind::Video => out.push(EsUnit::VideoConfig {
                    track: cursor.track_id,
                    sps: Bytes::copy_from_slice(
                        track.sequence_parameter_set().map_err(negotiation)?,
                    ),
                    pps: Bytes::copy_from_slice(
                        track.picture_parameter_set().map_err(negotiation)?,
                    ),
                }),
                TrackKind::Audio => {
                    let config = AacConfig {
                        object_type: track.audio_profile().map_err(negotiation)? as u8,
                        sample_rate_index: track.sample_freq_index().map_err(negotiation)? as u8,
                        channels: track.channel_config().map_err(negotiation)? as u8,
                    };
                    out.push(EsUnit::AudioConfig {
                        track: cursor.track_id,
                        config: config.to_bytes(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Emits up to `limit` samples across all tracks in decode order.
    /// Returns whether samples remain.
    pub fn read_units(&mut self, limit: usize, out: &mut Vec<EsUnit>) -> IngestResult<bool> {
        for _ in 0..limit {
            for cursor in &mut self.tracks {
                if cursor.peeked.is_none() && cursor.next <= cursor.count {
                    cursor.peeked = self
                        .reader
                        .read_sample(cursor.track_id, cursor.next)
                        .map_err(|e| IngestError::Stream(format!("mp4 sample: {e}")))?;
                    cursor.next += 1;
                }
            }

            // earliest decode time across timescales
            let Some(cursor) = self
                .tracks
                .iter_mut()
                .filter(|c| c.peeked.is_some())
                .min_by_key(|c| {
                    let start = c.peeked.as_ref().map_or(0, |s| s.start_time);
                    start as u128 * 1_000_000 / c.timescale.max(1) as u128
                })
            else {
                return Ok(false);
            };
            let Some(sample) = cursor.peeked.take() else {
                continue;
            };

            let timescale = cursor.timescale.max(1);
            let dts = ticks_to_duration(sample.start_time, timescale);
            let pts = ticks_to_duration(
                sample
                    .start_time
                    .saturating_add_signed(sample.rendering_offset as i64),
                timescale,
            );
            match cursor.kind {
                TrackKind::Video => out.push(EsUnit::Video {
                    track: cursor.track_id,
                    pts,
                    dts,
                    nalus: h264::split_length_prefixed(&sample.bytes, NAL_LENGTH_SIZE)?,
                }),
                TrackKind::Audio => out.push(EsUnit::Audio {
                    track: cursor.track_id,
                    pts,
                    data: sample.bytes,
                }),
            }
        }
        Ok(self
            .tracks
            .iter()
            .any(|c| c.peeked.is_some() || c.next <= c.count))
    }
}

/// Fragmented MP4 delivered one object at a time: the initialization section
/// first, then whole media segments.
#[derive(Default)]
pub struct Fmp4Demuxer {
    init: Option<Mp4Reader<Cursor<Bytes>>>,
}

impl Fmp4Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: &[u8], out: &mut Vec<EsUnit>) -> IngestResult<()> {
        let data = Bytes::copy_from_slice(object);
        let size = data.len() as u64;
        let Some(init) = &self.init else {
            let demuxer = Mp4Demuxer::open(Cursor::new(data), size)?;
            demuxer.describe(out)?;
            self.init = Some(demuxer.reader);
            return Ok(());
        };

        let fragment = init
            .read_fragment_header(Cursor::new(data), size)
            .map_err(|e| IngestError::Stream(format!("invalid media segment: {e}")))?;
        let mut demuxer = Mp4Demuxer::with_reader(fragment)?;
        while demuxer.read_units(usize::MAX, out)? {}
        Ok(())
    }
}
