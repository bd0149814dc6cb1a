//! Fragmented MP4 (ISO/IEC 14496-12) box writing: one init segment with a
//! track per codec, then `moof` + `mdat` pairs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::h264::AvcConfig,
    packet::{AudioCodec, CodecDescriptor, VideoCodec},
};

/// `sample_depends_on = 2`
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// `sample_depends_on = 1`, `sample_is_non_sync_sample`
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

const MOVIE_TIMESCALE: u32 = 1000;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_offset: u32,
}

/// The samples of one track within a fragment.
#[derive(Debug, Clone, Default)]
pub struct TrackRun {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub samples: Vec<Sample>,
    pub data: Vec<Bytes>,
}

impl TrackRun {
    fn data_len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }
}

fn write_box(buf: &mut BytesMut, kind: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut BytesMut,
    kind: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(buf, kind, |buf| {
        buf.put_u32(((version as u32) << 24) | (flags & 0x00ff_ffff));
        body(buf);
    });
}

/// Writes an MPEG-4 descriptor with an expandable size field.
fn write_descriptor(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    let len = body.len() as u32;
    for shift in [21, 14, 7] {
        if len >= 1 << shift {
            buf.put_u8(0x80 | ((len >> shift) & 0x7f) as u8);
        }
    }
    buf.put_u8((len & 0x7f) as u8);
    buf.put_slice(body);
}

pub fn init_segment(codecs: &[CodecDescriptor]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1024);
    write_box(&mut buf, b"ftyp", |buf| {
        buf.put_slice(b"iso5");
        buf.put_u32(512);
        for brand in [b"iso5", b"iso6", b"mp41"] {
            buf.put_slice(brand);
        }
    });
    write_box(&mut buf, b"moov", |buf| {
        write_mvhd(buf, codecs.len() as u32 + 1);
        for (index, codec) in codecs.iter().enumerate() {
            write_trak(buf, index as u32 + 1, codec);
        }
        write_box(buf, b"mvex", |buf| {
            for track_id in 1..=codecs.len() as u32 {
                write_full_box(buf, b"trex", 0, 0, |buf| {
                    buf.put_u32(track_id);
                    buf.put_u32(1); // sample description index
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.put_u32(0);
                });
            }
        });
    });
    buf.freeze()
}

fn write_mvhd(buf: &mut BytesMut, next_track_id: u32) {
    write_full_box(buf, b"mvhd", 0, 0, |buf| {
        buf.put_u32(0); // creation time
        buf.put_u32(0); // modification time
        buf.put_u32(MOVIE_TIMESCALE);
        buf.put_u32(0); // duration
        buf.put_u32(0x0001_0000); // rate
        buf.put_u16(0x0100); // volume
        buf.put_bytes(0, 10);
        for value in UNITY_MATRIX {
            buf.put_u32(value);
        }
        buf.put_bytes(0, 24);
        buf.put_u32(next_track_id);
    });
}

fn write_trak(buf: &mut BytesMut, track_id: u32, codec: &CodecDescriptor) {
    let (width, height) = match codec {
        CodecDescriptor::Video(VideoCodec::H264 { width, height, .. }) => (*width, *height),
        CodecDescriptor::Audio(_) => (0, 0),
    };
    write_box(buf, b"trak", |buf| {
        write_full_box(buf, b"tkhd", 0, 0x000003, |buf| {
            buf.put_u32(0);
            buf.put_u32(0);
            buf.put_u32(track_id);
            buf.put_u32(0);
            buf.put_u32(0); // duration
            buf.put_bytes(0, 8);
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate group
            buf.put_u16(if codec.is_audio() { 0x0100 } else { 0 });
            buf.put_u16(0);
            for value in UNITY_MATRIX {
                buf.put_u32(value);
            }
            buf.put_u32(width << 16);
            buf.put_u32(height << 16);
        });
        write_box(buf, b"mdia", |buf| {
            write_full_box(buf, b"mdhd", 0, 0, |buf| {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(codec.timescale());
                buf.put_u32(0);
                buf.put_u16(0x55c4); // und
                buf.put_u16(0);
            });
            write_full_box(buf, b"hdlr", 0, 0, |buf| {
                buf.put_u32(0);
                if codec.is_video() {
                    buf.put_slice(b"vide");
                    buf.put_bytes(0, 12);
                    buf.put_slice(b"VideoHandler\0");
                } else {
                    buf.put_slice(b"soun");
                    buf.put_bytes(0, 12);
                    buf.put_slice(b"SoundHandler\0");
                }
            });
            write_box(buf, b"minf", |buf| {
                if codec.is_video() {
                    write_full_box(buf, b"vmhd", 0, 1, |buf| buf.put_bytes(0, 8));
                } else {
                    write_full_box(buf, b"smhd", 0, 0, |buf| buf.put_u32(0));
                }
                write_box(buf, b"dinf", |buf| {
                    write_full_box(buf, b"dref", 0, 0, |buf| {
                        buf.put_u32(1);
                        write_full_box(buf, b"url ", 0, 1, |_| {});
                    });
                });
                write_box(buf, b"stbl", |buf| {
                    write_full_box(buf, b"stsd", 0, 0, |buf| {
                        buf.put_u32(1);
                        write_sample_entry(buf, track_id, codec);
                    });
                    write_full_box(buf, b"stts", 0, 0, |buf| buf.put_u32(0));
                    write_full_box(buf, b"stsc", 0, 0, |buf| buf.put_u32(0));
                    write_full_box(buf, b"stsz", 0, 0, |buf| {
                        buf.put_u32(0);
                        buf.put_u32(0);
                    });
                    write_full_box(buf, b"stco", 0, 0, |buf| buf.put_u32(0));
                });
            });
        });
    });
}

fn write_sample_entry(buf: &mut BytesMut, track_id: u32, codec: &CodecDescriptor) {
    match codec {
        CodecDescriptor::Video(VideoCodec::H264 {
            sps,
            pps,
            width,
            height,
        }) => write_box(buf, b"avc1", |buf| {
            buf.put_bytes(0, 6);
            buf.put_u16(1); // data reference index
            buf.put_bytes(0, 16);
            buf.put_u16(*width as u16);
            buf.put_u16(*height as u16);
            buf.put_u32(0x0048_0000); // 72 dpi
            buf.put_u32(0x0048_0000);
            buf.put_u32(0);
            buf.put_u16(1); // frame count
            buf.put_bytes(0, 32); // compressor name
            buf.put_u16(0x0018);
            buf.put_i16(-1);
            write_box(buf, b"avcC", |buf| buf.put_slice(&AvcConfig::build(sps, pps)));
        }),
        CodecDescriptor::Audio(AudioCodec::Aac {
            config,
            sample_rate,
            channels,
        }) => write_box(buf, b"mp4a", |buf| {
            buf.put_bytes(0, 6);
            buf.put_u16(1);
            buf.put_bytes(0, 8);
            buf.put_u16(*channels as u16);
            buf.put_u16(16); // sample size
            buf.put_u32(0);
            // 16.16 fixed point, rates above it are left to the esds
            buf.put_u32(if *sample_rate <= 0xffff { sample_rate << 16 } else { 0 });
            write_full_box(buf, b"esds", 0, 0, |buf| write_es_descriptor(buf, track_id, config));
        }),
    }
}

fn write_es_descriptor(buf: &mut BytesMut, track_id: u32, config: &[u8]) {
    let mut specific = BytesMut::new();
    write_descriptor(&mut specific, 0x05, config);

    let mut decoder = BytesMut::new();
    decoder.put_u8(0x40); // MPEG-4 audio
    decoder.put_u8(0x15); // audio stream
    decoder.put_bytes(0, 3); // buffer size
    decoder.put_u32(0); // max bitrate
    decoder.put_u32(0); // average bitrate
    decoder.put_slice(&specific);

    let mut es = BytesMut::new();
    es.put_u16(track_id as u16);
    es.put_u8(0);
    write_descriptor(&mut es, 0x04, &decoder);
    write_descriptor(&mut es, 0x06, &[0x02]);

    write_descriptor(buf, 0x03, &es);
}

/// One `moof` + `mdat` pair. Tracks without samples are left out.
pub fn media_segment(sequence: u32, runs: &[TrackRun]) -> Bytes {
    let runs = runs
        .iter()
        .filter(|run| !run.samples.is_empty())
        .collect::<Vec<_>>();
    let data_len = runs.iter().map(|run| run.data_len()).sum::<usize>();

    let mut buf = BytesMut::with_capacity(data_len + 256);
    let mut offset_fields = Vec::with_capacity(runs.len());
    write_box(&mut buf, b"moof", |buf| {
        write_full_box(buf, b"mfhd", 0, 0, |buf| buf.put_u32(sequence));
        for run in &runs {
            write_box(buf, b"traf", |buf| {
                // default-base-is-moof
                write_full_box(buf, b"tfhd", 0, 0x020000, |buf| buf.put_u32(run.track_id));
                write_full_box(buf, b"tfdt", 1, 0, |buf| buf.put_u64(run.base_decode_time));
                // data offset, then duration, size, flags and composition
                // offset per sample
                write_full_box(buf, b"trun", 0, 0x000f01, |buf| {
                    buf.put_u32(run.samples.len() as u32);
                    offset_fields.push(buf.len());
                    buf.put_u32(0);
                    for sample in &run.samples {
                        buf.put_u32(sample.duration);
                        buf.put_u32(sample.size);
                        buf.put_u32(sample.flags);
                        buf.put_u32(sample.composition_offset);
                    }
                });
            });
        }
    });

    // offsets are relative to the start of moof, past the mdat header
    let mut data_offset = buf.len() + 8;
    for (field, run) in offset_fields.into_iter().zip(&runs) {
        buf[field..field + 4].copy_from_slice(&(data_offset as u32).to_be_bytes());
        data_offset += run.data_len();
    }

    write_box(&mut buf, b"mdat", |buf| {
        for run in &runs {
            for data in &run.data {
                buf.put_slice(data);
            }
        }
    });
    buf.freeze()
}
